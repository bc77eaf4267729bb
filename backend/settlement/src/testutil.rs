//! In-memory fakes of the collaborators and a [`Harness`] wiring them to an
//! engine over a [`MemoryStore`].
//!
//! Users are addressed by a short name: `pubkey("rec") == "GREC"`,
//! `seed("rec") == "SREC"`, and the wallet unlocks with `password("rec")`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::EngineSettings;
use crate::engine::{Collaborators, Engine};
use crate::errors::{EngineError, Result};
use crate::identity::IdentityService;
use crate::ledger::{Asset, EscrowService, Ledger, TxHash, Wallet};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::store::MemoryStore;
use crate::types::{Entity, EntityRole, Investor, Project, ProjectIndex, Recipient, User};

pub const PLATFORM_PUBKEY: &str = "GPLATFORM";
pub const STABLECOIN: &str = "STABLEUSD";

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub asset_code: String,
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub memo: String,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashSet<String>,
    balances: HashMap<(String, String), f64>,
    transfers: Vec<TransferRecord>,
    /// (holder, asset code, amount)
    issued: Vec<(String, String, f64)>,
    issuer_inits: usize,
    frozen: HashSet<ProjectIndex>,
    failing: HashSet<String>,
    /// Pause inside every transfer so concurrent callers interleave.
    transfer_delay: Option<Duration>,
    next_tx: u64,
}

impl LedgerState {
    fn tx(&mut self, kind: &str) -> TxHash {
        self.next_tx += 1;
        format!("{kind}-{}", self.next_tx)
    }

    fn credit(&mut self, holder: &str, code: &str, amount: f64) {
        *self
            .balances
            .entry((holder.to_string(), code.to_string()))
            .or_insert(0.0) += amount;
    }
}

#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    /// Open `pubkey` with `amount` of stablecoin.
    pub fn set_stable(&self, pubkey: &str, amount: f64) {
        let mut s = locked(&self.state);
        s.accounts.insert(pubkey.to_string());
        s.balances
            .insert((pubkey.to_string(), STABLECOIN.to_string()), amount);
    }

    pub fn stable_balance(&self, pubkey: &str) -> f64 {
        locked(&self.state)
            .balances
            .get(&(pubkey.to_string(), STABLECOIN.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn remove_account(&self, pubkey: &str) {
        locked(&self.state).accounts.remove(pubkey);
    }

    pub fn fail_transfers_to(&self, pubkey: &str) {
        locked(&self.state).failing.insert(pubkey.to_string());
    }

    pub fn delay_transfers(&self, delay: Duration) {
        locked(&self.state).transfer_delay = Some(delay);
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        locked(&self.state).transfers.clone()
    }

    /// Asset codes and amounts issued to `pubkey`.
    pub fn issued_to(&self, pubkey: &str) -> Vec<(String, f64)> {
        locked(&self.state)
            .issued
            .iter()
            .filter(|(holder, _, _)| holder == pubkey)
            .map(|(_, code, amount)| (code.clone(), *amount))
            .collect()
    }

    pub fn issuer_inits(&self) -> usize {
        locked(&self.state).issuer_inits
    }

    pub fn is_frozen(&self, project: ProjectIndex) -> bool {
        locked(&self.state).frozen.contains(&project)
    }

    fn credit(&self, holder: &str, code: &str, amount: f64) {
        locked(&self.state).credit(holder, code, amount);
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn account_exists(&self, pubkey: &str) -> Result<bool> {
        Ok(locked(&self.state).accounts.contains(pubkey))
    }

    async fn balance(&self, pubkey: &str, asset_code: &str) -> Result<f64> {
        Ok(locked(&self.state)
            .balances
            .get(&(pubkey.to_string(), asset_code.to_string()))
            .copied()
            .unwrap_or(0.0))
    }

    async fn create_trustline(
        &self,
        _asset: &Asset,
        _pubkey: &str,
        _limit: f64,
        _signer: &SecretString,
    ) -> Result<TxHash> {
        Ok(locked(&self.state).tx("trust"))
    }

    async fn transfer(
        &self,
        asset: &Asset,
        from: &str,
        to: &str,
        amount: f64,
        _signer: &SecretString,
        memo: &str,
    ) -> Result<TxHash> {
        let delay = locked(&self.state).transfer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut s = locked(&self.state);
        if s.failing.contains(to) {
            return Err(EngineError::Ledger(format!("transfer to {to} rejected")));
        }
        s.credit(from, &asset.code, -amount);
        s.credit(to, &asset.code, amount);
        s.transfers.push(TransferRecord {
            asset_code: asset.code.clone(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            memo: memo.to_string(),
        });
        Ok(s.tx("transfer"))
    }

    async fn init_issuer(&self, project: ProjectIndex, _funder: &SecretString) -> Result<String> {
        locked(&self.state).issuer_inits += 1;
        Ok(format!("GISSUER{project}"))
    }

    async fn issue_asset(
        &self,
        _project: ProjectIndex,
        asset: &Asset,
        to: &str,
        amount: f64,
    ) -> Result<TxHash> {
        let mut s = locked(&self.state);
        s.credit(to, &asset.code, amount);
        s.issued.push((to.to_string(), asset.code.clone(), amount));
        Ok(s.tx("issue"))
    }

    async fn freeze_issuer(&self, project: ProjectIndex) -> Result<TxHash> {
        let mut s = locked(&self.state);
        s.frozen.insert(project);
        Ok(s.tx("freeze"))
    }
}

// ─────────────────────────────────────────────────────────
// Wallet: encrypted seed is "<password>|<seed>", pubkey is seed with G for S
// ─────────────────────────────────────────────────────────

pub struct FakeWallet;

#[async_trait]
impl Wallet for FakeWallet {
    async fn decrypt_seed(&self, encrypted: &[u8], secret: &SecretString) -> Result<SecretString> {
        let text = String::from_utf8_lossy(encrypted);
        match text.split_once('|') {
            Some((pwd, seed)) if pwd == secret.expose_secret() => {
                Ok(SecretString::from(seed.to_string()))
            }
            _ => Err(EngineError::Ledger("could not decrypt seed".into())),
        }
    }

    async fn public_key(&self, seed: &SecretString) -> Result<String> {
        let seed = seed.expose_secret();
        match seed.strip_prefix('S') {
            Some(rest) => Ok(format!("G{rest}")),
            None => Err(EngineError::Ledger("malformed seed".into())),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Escrow
// ─────────────────────────────────────────────────────────

#[derive(Default)]
struct EscrowState {
    created: Vec<(ProjectIndex, String)>,
    funded: HashMap<String, f64>,
    /// (escrow, destination, amount)
    disbursements: Vec<(String, String, f64)>,
    failing: HashSet<String>,
}

pub struct FakeEscrow {
    ledger: Arc<FakeLedger>,
    state: Mutex<EscrowState>,
}

impl FakeEscrow {
    pub fn new(ledger: Arc<FakeLedger>) -> Self {
        Self {
            ledger,
            state: Mutex::new(EscrowState::default()),
        }
    }

    pub fn fail_for(&self, destination: &str) {
        locked(&self.state).failing.insert(destination.to_string());
    }

    pub fn created(&self) -> Vec<(ProjectIndex, String)> {
        locked(&self.state).created.clone()
    }

    pub fn funded(&self, escrow: &str) -> f64 {
        locked(&self.state).funded.get(escrow).copied().unwrap_or(0.0)
    }

    pub fn disbursements(&self) -> Vec<(String, String, f64)> {
        locked(&self.state).disbursements.clone()
    }

    pub fn paid_to(&self, destination: &str) -> f64 {
        locked(&self.state)
            .disbursements
            .iter()
            .filter(|(_, dest, _)| dest == destination)
            .map(|(_, _, amount)| amount)
            .sum()
    }
}

#[async_trait]
impl EscrowService for FakeEscrow {
    async fn create(
        &self,
        project: ProjectIndex,
        _owner_pubkey: &str,
        _counterparty_seed: &SecretString,
        _platform_seed: &SecretString,
    ) -> Result<String> {
        let escrow = format!("GESCROW{project}");
        locked(&self.state).created.push((project, escrow.clone()));
        Ok(escrow)
    }

    async fn fund(&self, escrow_pubkey: &str, amount: f64, _signer: &SecretString) -> Result<TxHash> {
        *locked(&self.state)
            .funded
            .entry(escrow_pubkey.to_string())
            .or_insert(0.0) += amount;
        self.ledger.credit(escrow_pubkey, STABLECOIN, amount);
        Ok(format!("fund-{escrow_pubkey}"))
    }

    async fn disburse(
        &self,
        escrow_pubkey: &str,
        destination: &str,
        _signer: &SecretString,
        amount: f64,
        _memo: &str,
        asset: &Asset,
    ) -> Result<TxHash> {
        {
            let mut s = locked(&self.state);
            if s.failing.contains(destination) {
                return Err(EngineError::Escrow(format!("payment to {destination} failed")));
            }
            s.disbursements
                .push((escrow_pubkey.to_string(), destination.to_string(), amount));
        }
        self.ledger.credit(escrow_pubkey, &asset.code, -amount);
        self.ledger.credit(destination, &asset.code, amount);
        Ok(format!("disburse-{destination}"))
    }
}

// ─────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeIdentity {
    users: Mutex<HashMap<u64, User>>,
}

impl FakeIdentity {
    pub fn insert(&self, user: User) {
        locked(&self.users).insert(user.index, user);
    }

    pub fn update(&self, index: u64, f: impl FnOnce(&mut User)) {
        if let Some(user) = locked(&self.users).get_mut(&index) {
            f(user);
        }
    }

    pub fn reputation(&self, index: u64) -> f64 {
        locked(&self.users)
            .get(&index)
            .map_or(0.0, |u| u.reputation)
    }
}

#[async_trait]
impl IdentityService for FakeIdentity {
    async fn retrieve(&self, index: u64) -> Result<User> {
        locked(&self.users)
            .get(&index)
            .cloned()
            .ok_or_else(|| EngineError::not_found("user", index))
    }

    async fn validate(&self, username: &str, token: &str) -> Result<User> {
        let users = locked(&self.users);
        let user = users
            .values()
            .find(|u| u.username == username)
            .ok_or_else(|| EngineError::Identity(format!("unknown user {username}")))?;
        if token != Harness::token(username) {
            return Err(EngineError::Identity("invalid token".into()));
        }
        Ok(user.clone())
    }

    async fn change_reputation(&self, index: u64, delta: f64) -> Result<()> {
        let mut users = locked(&self.users);
        let user = users
            .get_mut(&index)
            .ok_or_else(|| EngineError::Identity(format!("user {index} not found")))?;
        user.reputation += delta;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        locked(&self.sent).clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        locked(&self.sent).iter().filter(|n| n.kind == kind).count()
    }

    pub fn clear(&self) {
        locked(&self.sent).clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        locked(&self.sent).push(notification);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: Arc<Engine>,
    pub ledger: Arc<FakeLedger>,
    pub escrow: Arc<FakeEscrow>,
    pub identity: Arc<FakeIdentity>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    /// Short timings; a bill of 400 when no teller energy is reported.
    pub fn with_settings(adjust: impl FnOnce(&mut EngineSettings)) -> Self {
        let mut settings = EngineSettings::new(PLATFORM_PUBKEY, SecretString::from("SPLATFORM"));
        settings.lock_timeout = Duration::from_secs(2);
        settings.unlock_poll_interval = Duration::from_millis(10);
        settings.reminder_interval = Duration::from_secs(3600);
        settings.energy_price = 1.0;
        settings.average_consumption_kwh = 400.0;
        adjust(&mut settings);

        let ledger = Arc::new(FakeLedger::default());
        let escrow = Arc::new(FakeEscrow::new(Arc::clone(&ledger)));
        let identity = Arc::new(FakeIdentity::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::new(
            Collaborators {
                store: Arc::new(MemoryStore::new()),
                ledger: ledger.clone(),
                wallet: Arc::new(FakeWallet),
                escrow: escrow.clone(),
                identity: identity.clone(),
                notifier: notifier.clone(),
            },
            settings,
        );
        Self {
            engine,
            ledger,
            escrow,
            identity,
            notifier,
        }
    }

    pub fn seed(name: &str) -> SecretString {
        SecretString::from(format!("S{}", name.to_uppercase()))
    }

    pub fn pubkey(name: &str) -> String {
        format!("G{}", name.to_uppercase())
    }

    pub fn password(name: &str) -> SecretString {
        SecretString::from(format!("pwd-{name}"))
    }

    pub fn token(name: &str) -> String {
        format!("token-{name}")
    }

    pub fn email(name: &str) -> String {
        format!("{name}@example.org")
    }

    /// KYC'd user whose wallet unlocks with `password(name)`.
    pub fn add_user(&self, index: u64, name: &str, notification: bool) -> User {
        let user = User {
            index,
            name: name.to_string(),
            username: name.to_string(),
            email: Self::email(name),
            public_key: Self::pubkey(name),
            encrypted_seed: format!("pwd-{name}|S{}", name.to_uppercase()).into_bytes(),
            kyc: true,
            notification,
            ..User::default()
        };
        self.identity.insert(user.clone());
        user
    }

    pub async fn add_investor(&self, index: u64, name: &str, stablecoin: f64) -> User {
        let user = self.add_user(index, name, true);
        self.ledger.set_stable(&user.public_key, stablecoin);
        self.engine
            .register_investor(&Investor {
                index,
                ..Investor::default()
            })
            .await
            .unwrap();
        user
    }

    pub async fn add_recipient(&self, index: u64, name: &str) -> User {
        let user = self.add_user(index, name, true);
        self.ledger.set_stable(&user.public_key, 0.0);
        self.engine
            .register_recipient(&Recipient {
                index,
                ..Recipient::default()
            })
            .await
            .unwrap();
        user
    }

    pub async fn add_entity(&self, index: u64, name: &str, role: EntityRole) -> User {
        let user = self.add_user(index, name, true);
        self.engine
            .register_entity(&Entity {
                index,
                role,
                ..Entity::default()
            })
            .await
            .unwrap();
        user
    }

    /// Unsaved munibond project with a 30-day payback period.
    pub fn project(&self, index: ProjectIndex, total_value: f64, recipient: u64) -> Project {
        let mut p = Project::new(
            index,
            total_value,
            recipient,
            format!("project-{index}"),
            Engine::now(),
        );
        p.payback_period_secs = 30 * 24 * 60 * 60;
        p.estimated_acquisition = 5;
        p
    }

    pub async fn save(&self, project: &Project) {
        self.engine.save_project(project).await.unwrap();
    }
}
