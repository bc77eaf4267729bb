//! Contractor bid selection.
//!
//! Each candidate is a stage-2 [`Project`] carrying one contractor's bid
//! (`total_value` as price, `estimated_acquisition` as completion time)
//! against the same proposal. On exact ties the earliest bid in input order
//! wins, in every rule.

use std::sync::Arc;

use tracing::info;

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::stages::administrative;
use crate::types::{AuctionType, Project, ProjectIndex};

/// Position of the first minimum under `key`.
fn first_min_by<F>(bids: &[Project], key: F) -> Option<usize>
where
    F: Fn(&Project) -> f64,
{
    let mut best: Option<(usize, f64)> = None;
    for (i, bid) in bids.iter().enumerate() {
        let k = key(bid);
        match best {
            Some((_, current)) if k >= current => {}
            _ => best = Some((i, k)),
        }
    }
    best.map(|(i, _)| i)
}

/// Lowest price wins and pays its own price.
pub fn select_blind(bids: &[Project]) -> Result<Project> {
    let winner = first_min_by(bids, |p| p.total_value).ok_or(EngineError::EmptyAuction)?;
    Ok(bids[winner].clone())
}

/// Lowest price wins and is paid the lowest price among the other bids.
pub fn select_vickrey(bids: &[Project]) -> Result<Project> {
    let winner = first_min_by(bids, |p| p.total_value).ok_or(EngineError::EmptyAuction)?;
    let mut selected = bids[winner].clone();

    let second = bids
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != winner)
        .map(|(_, p)| p.total_value)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
    if let Some(price) = second {
        selected.total_value = price;
    }
    Ok(selected)
}

/// Shortest completion time wins.
pub fn select_least_time(bids: &[Project]) -> Result<Project> {
    let winner = first_min_by(bids, |p| f64::from(p.estimated_acquisition))
        .ok_or(EngineError::EmptyAuction)?;
    Ok(bids[winner].clone())
}

pub fn select(rule: AuctionType, bids: &[Project]) -> Result<Project> {
    match rule {
        AuctionType::Blind => select_blind(bids),
        AuctionType::Vickrey => select_vickrey(bids),
        AuctionType::Time => select_least_time(bids),
    }
}

impl Engine {
    pub async fn set_auction_type(self: &Arc<Self>, index: ProjectIndex, name: &str) -> Result<Project> {
        let _guard = self.project_locks.acquire(index).await;
        let mut project = self.project(index).await?;
        project.auction_type = AuctionType::parse(name);
        self.save_project(&project).await?;
        Ok(project)
    }

    /// Pick the winner among the recipient's stage-2 bids and move it to the raise.
    ///
    /// The rule is taken from the first bid. Losing bids stay at stage 2.
    pub async fn settle_auction(self: &Arc<Self>, recipient_index: u64) -> Result<Project> {
        let bids: Vec<Project> = self
            .projects_at_stage(2)
            .await?
            .into_iter()
            .filter(|p| p.recipient_index == recipient_index)
            .collect();
        let rule = bids.first().ok_or(EngineError::EmptyAuction)?.auction_type;
        let winner = select(rule, &bids)?;
        info!(
            "Auction ({rule:?}) for recipient {recipient_index}: project {} wins at {}",
            winner.index, winner.total_value
        );

        let _guard = self.project_locks.acquire(winner.index).await;
        let mut project = self.project(winner.index).await?;
        if project.stage != 2 {
            return Err(EngineError::WrongStage {
                project: project.index,
                stage: project.stage,
                required: "2",
            });
        }
        project.total_value = winner.total_value;
        self.apply_stage(&mut project, 4, administrative("settle_auction"))
            .await?;
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;

    fn bid(index: u64, value: f64, years: u32) -> Project {
        let mut p = Project::new(index, value, 20, "bid", 0);
        p.estimated_acquisition = years;
        p
    }

    fn bids() -> Vec<Project> {
        vec![bid(1, 28000.0, 6), bid(2, 14000.0, 3), bid(3, 14000.0, 5)]
    }

    #[test]
    fn blind_takes_first_lowest() {
        let w = select_blind(&bids()).unwrap();
        assert_eq!(w.index, 2);
        assert_eq!(w.total_value, 14000.0);
    }

    #[test]
    fn vickrey_pays_lowest_remaining_bid() {
        let w = select_vickrey(&bids()).unwrap();
        assert_eq!(w.index, 2);
        assert_eq!(w.total_value, 14000.0);

        let w = select_vickrey(&[bid(1, 9000.0, 1), bid(2, 12000.0, 1), bid(3, 15000.0, 1)])
            .unwrap();
        assert_eq!(w.index, 1);
        assert_eq!(w.total_value, 12000.0);
    }

    #[test]
    fn vickrey_with_single_bid_keeps_price() {
        let w = select_vickrey(&[bid(7, 5000.0, 2)]).unwrap();
        assert_eq!(w.total_value, 5000.0);
    }

    #[test]
    fn least_time_picks_fastest() {
        assert_eq!(select_least_time(&bids()).unwrap().index, 2);
        let tied = vec![bid(1, 1.0, 4), bid(2, 1.0, 2), bid(3, 1.0, 2)];
        assert_eq!(select_least_time(&tied).unwrap().index, 2);
    }

    #[test]
    fn empty_auction_is_an_error() {
        assert!(matches!(select_blind(&[]), Err(EngineError::EmptyAuction)));
        assert!(matches!(select_vickrey(&[]), Err(EngineError::EmptyAuction)));
        assert!(matches!(select_least_time(&[]), Err(EngineError::EmptyAuction)));
    }

    #[tokio::test]
    async fn settle_auction_promotes_winner_to_raise() {
        let h = Harness::new();
        for mut p in bids() {
            p.stage = 2;
            p.auction_type = AuctionType::Vickrey;
            h.save(&p).await;
        }
        // another recipient's bid is ignored
        let mut other = bid(4, 100.0, 1);
        other.stage = 2;
        other.recipient_index = 99;
        h.save(&other).await;

        let winner = h.engine.settle_auction(20).await.unwrap();
        assert_eq!(winner.index, 2);
        assert_eq!(winner.stage, 4);
        assert_eq!(h.engine.project(2).await.unwrap().stage, 4);
        assert_eq!(h.engine.project(1).await.unwrap().stage, 2);
        assert_eq!(h.engine.project(4).await.unwrap().stage, 2);
    }

    #[tokio::test]
    async fn settle_auction_without_bids_fails() {
        let h = Harness::new();
        assert!(matches!(
            h.engine.settle_auction(20).await,
            Err(EngineError::EmptyAuction)
        ));
    }

    #[tokio::test]
    async fn unknown_auction_type_falls_back_to_blind() {
        let h = Harness::new();
        h.save(&bid(1, 10.0, 1)).await;
        let p = h.engine.set_auction_type(1, "english").await.unwrap();
        assert_eq!(p.auction_type, AuctionType::Blind);
    }
}
