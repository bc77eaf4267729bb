//! End-to-end runs across the lifecycle: origination through auction, raise,
//! unlock, escrow funding, payback and escalation.

use std::time::Duration;

use tokio::time::sleep;

use crate::errors::EngineError;
use crate::monitor::EscalationTier;
use crate::notify::NotificationKind;
use crate::projects::{ProjectTerms, Proposal};
use crate::tasks::TaskKind;
use crate::testutil::{approx, Harness};
use crate::types::{AuctionType, EntityRole, Project, ProjectIndex};

const MONTH: u64 = 30 * 24 * 60 * 60;

async fn wait_until_funded(h: &Harness, index: ProjectIndex) -> Project {
    for _ in 0..300 {
        let p = h.engine.project(index).await.unwrap();
        if p.stage == 5 && h.engine.tasks().is_running(index, TaskKind::PaybackMonitor) {
            return p;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("project {index} was never funded");
}

/// Project 1 worth 1000 for recipient "rec", raised by `investors` and unlocked.
async fn funded(h: &Harness, investors: &[(u64, &str, f64)], guarantor: Option<u64>) -> Project {
    h.add_recipient(20, "rec").await;
    let mut p = h.project(1, 1000.0, 20);
    p.stage = 4;
    p.guarantor_index = guarantor;
    h.save(&p).await;

    for (index, name, amount) in investors {
        h.add_investor(*index, name, *amount).await;
        h.engine
            .invest(1, *index, *amount, &Harness::seed(name))
            .await
            .unwrap();
    }
    h.engine
        .unlock_project("rec", &Harness::token("rec"), 1, Harness::password("rec"))
        .await
        .unwrap();
    wait_until_funded(h, 1).await
}

#[tokio::test]
async fn project_runs_from_origination_to_first_payback() {
    let h = Harness::new();
    h.add_entity(10, "orig", EntityRole::Originator).await;
    h.add_entity(11, "solarco", EntityRole::Contractor).await;
    h.add_entity(12, "pricyco", EntityRole::Contractor).await;
    h.add_recipient(20, "school").await;
    h.add_entity(50, "guard", EntityRole::Guarantor).await;
    h.add_investor(40, "alice", 4000.0).await;

    let terms = ProjectTerms {
        payback_period_secs: MONTH,
        ..ProjectTerms::default()
    };
    let originated = h
        .engine
        .originate(10, 20, 4000.0, terms, "school-roof")
        .await
        .unwrap();
    assert_eq!(originated.stage, 0);
    h.engine.assign_guarantor(originated.index, 50).await.unwrap();
    h.engine.recipient_authorize(originated.index, 20).await.unwrap();

    let bid = |contractor, total_value, metadata: &str| Proposal {
        contractor_index: contractor,
        total_value,
        years: 5,
        auction_type: AuctionType::Blind,
        payback_period_secs: None,
        metadata: metadata.to_string(),
    };
    let cheap = h
        .engine
        .propose(originated.index, bid(11, 4000.0, "solarco-bid"))
        .await
        .unwrap();
    h.engine
        .propose(originated.index, bid(12, 4600.0, "pricyco-bid"))
        .await
        .unwrap();

    let winner = h.engine.settle_auction(20).await.unwrap();
    assert_eq!(winner.index, cheap.index);
    assert_eq!(winner.stage, 4);
    assert_eq!(winner.payback_period_secs, MONTH);
    assert_eq!(winner.guarantor_index, Some(50));

    // the full raise locks the project and asks the recipient to unlock
    let p = h
        .engine
        .invest(winner.index, 40, 4000.0, &Harness::seed("alice"))
        .await
        .unwrap();
    assert!(p.lock);
    assert_eq!(h.notifier.count(NotificationKind::UnlockRequest), 1);
    assert!(h.engine.tasks().is_running(winner.index, TaskKind::UnlockWait));

    h.engine
        .unlock_project("school", &Harness::token("school"), winner.index, Harness::password("school"))
        .await
        .unwrap();
    let p = wait_until_funded(&h, winner.index).await;
    let escrow = format!("GESCROW{}", winner.index);
    assert_eq!(p.escrow_pubkey.as_deref(), Some(escrow.as_str()));
    assert_eq!(h.escrow.funded(&escrow), 4000.0);
    assert_eq!(p.bal_left, 4000.0);
    // contractor and investor rewarded on entering construction
    assert!(h.identity.reputation(11) > 0.0);
    assert!(h.identity.reputation(40) > 0.0);

    h.ledger.set_stable(&Harness::pubkey("school"), 500.0);
    let receipt = h
        .engine
        .payback(20, winner.index, 500.0, &Harness::seed("school"))
        .await
        .unwrap();
    assert!(approx(receipt.ownership_pct, 0.025));
    assert!(approx(receipt.bal_left, 4000.0 - 0.975 * 500.0));
    assert_eq!(receipt.stage, 5);
    let report = receipt.distribution.unwrap();
    assert!(approx(report.total_delivered(), 25.0));
    assert!(approx(h.escrow.paid_to(&Harness::pubkey("alice")), 25.0));
    assert!(approx(h.ledger.stable_balance(&escrow), 4000.0 + 500.0 - 25.0));

    let rec = h.engine.recipient(20).await.unwrap();
    assert!(rec.next_payment_interval.is_some());

    // a recipient who just paid is on track for the rest of the period
    h.engine.stop(winner.index);
    let paid_at = h.engine.project(winner.index).await.unwrap().date_last_paid.unwrap();
    let cycle = h
        .engine
        .run_monitor_cycle(winner.index, paid_at + 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cycle.tier, EscalationTier::OnTrack);
    assert!(cycle.factor < 0.001);
}

#[tokio::test]
async fn paying_off_closes_the_project_and_stops_monitoring() {
    let h = Harness::new();
    funded(&h, &[(40, "alice", 1000.0)], None).await;

    h.ledger.set_stable(&Harness::pubkey("rec"), 1400.0);
    let receipt = h
        .engine
        .payback(20, 1, 1400.0, &Harness::seed("rec"))
        .await
        .unwrap();

    assert_eq!(receipt.ownership_shift, 1.0);
    assert_eq!(receipt.bal_left, 0.0);
    assert_eq!(receipt.stage, 9);
    let p = h.engine.project(1).await.unwrap();
    assert_eq!(p.amount_owed, 0.0);
    assert!(!h.engine.tasks().is_running(1, TaskKind::PaybackMonitor));
    assert!(!h.engine.tasks().is_running(1, TaskKind::PaymentReminder));

    assert!(matches!(
        h.engine.invest(1, 40, 10.0, &Harness::seed("alice")).await,
        Err(EngineError::WrongStage { stage: 9, .. })
    ));
}

#[tokio::test]
async fn one_failing_payee_does_not_block_the_rest() {
    let h = Harness::new();
    funded(&h, &[(40, "alice", 600.0), (41, "bob", 400.0)], None).await;
    h.escrow.fail_for(&Harness::pubkey("bob"));

    h.ledger.set_stable(&Harness::pubkey("rec"), 800.0);
    let receipt = h
        .engine
        .payback(20, 1, 800.0, &Harness::seed("rec"))
        .await
        .unwrap();

    let report = receipt.distribution.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.failed, vec![Harness::pubkey("bob")]);
    // 5% of 800, alice holds 60%
    assert!(approx(h.escrow.paid_to(&Harness::pubkey("alice")), 24.0));
    assert_eq!(h.escrow.paid_to(&Harness::pubkey("bob")), 0.0);
    assert!(approx(h.engine.project(1).await.unwrap().ownership_shift, 0.4));
    h.engine.stop(1);
}

#[tokio::test]
async fn missed_payments_escalate_to_first_loss_cover() {
    let h = Harness::new();
    h.add_entity(50, "guard", EntityRole::Guarantor).await;
    h.ledger.set_stable(&Harness::pubkey("guard"), 1000.0);
    h.engine
        .add_first_loss_guarantee(50, Harness::password("guard"), 300.0)
        .await
        .unwrap();
    let p = funded(&h, &[(40, "alice", 1000.0)], Some(50)).await;
    h.engine.stop(1);
    h.notifier.clear();

    let period = p.payback_period_secs as i64;
    let start = p.date_initiated;

    let gentle = h.engine.run_monitor_cycle(1, start + 3 * period).await.unwrap().unwrap();
    assert_eq!(gentle.tier, EscalationTier::Gentle);
    assert_eq!(h.notifier.count(NotificationKind::GentlePaybackAlert), 1);

    let stern = h.engine.run_monitor_cycle(1, start + 5 * period).await.unwrap().unwrap();
    assert_eq!(stern.tier, EscalationTier::Stern);
    assert_eq!(h.notifier.count(NotificationKind::SternPaybackAlert), 1);
    assert_eq!(h.notifier.count(NotificationKind::SternPaybackAlertInvestor), 1);
    assert_eq!(h.notifier.count(NotificationKind::SternPaybackAlertGuarantor), 1);

    let cut = h.engine.run_monitor_cycle(1, start + 7 * period).await.unwrap().unwrap();
    assert_eq!(cut.tier, EscalationTier::Disconnection);
    assert!(cut.first_loss_tx.is_some());
    assert_eq!(h.notifier.count(NotificationKind::DisconnectionInvestor), 1);
    assert_eq!(h.notifier.count(NotificationKind::DisconnectionGuarantor), 1);
    assert!(cut.amount_owed > stern.amount_owed);

    assert_eq!(h.ledger.stable_balance("GESCROW1"), 1300.0);
    assert_eq!(h.engine.entity(50).await.unwrap().first_loss_guarantee_amt, 0.0);

    // pledge exhausted, a further disconnection cycle moves nothing
    let again = h.engine.run_monitor_cycle(1, start + 9 * period).await.unwrap().unwrap();
    assert!(again.first_loss_tx.is_none());
    assert_eq!(h.ledger.stable_balance("GESCROW1"), 1300.0);
}

#[tokio::test]
async fn resume_restarts_waits_and_monitors() {
    let h = Harness::new();
    h.add_recipient(20, "rec").await;

    let mut waiting = h.project(1, 1000.0, 20);
    waiting.stage = 4;
    waiting.lock = true;
    h.save(&waiting).await;

    let mut paying = h.project(2, 1000.0, 20);
    paying.stage = 6;
    paying.escrow_pubkey = Some("GESCROW2".into());
    paying.escrow_active = true;
    h.save(&paying).await;

    let mut done = h.project(3, 1000.0, 20);
    done.stage = 9;
    done.escrow_pubkey = Some("GESCROW3".into());
    done.escrow_active = true;
    h.save(&done).await;

    assert_eq!(h.engine.resume().await.unwrap(), 2);
    assert!(h.engine.tasks().is_running(1, TaskKind::UnlockWait));
    assert!(h.engine.tasks().is_running(2, TaskKind::PaybackMonitor));
    assert!(h.engine.tasks().is_running(2, TaskKind::PaymentReminder));
    assert!(!h.engine.tasks().is_running(3, TaskKind::PaybackMonitor));
    h.engine.shutdown();
}
