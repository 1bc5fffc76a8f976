//! Wallet transaction engine.
//!
//! Deposit, withdraw and transfer with exactly-once semantics: every
//! operation runs inside the idempotency registry, locks participant rows
//! `FOR UPDATE` (two-party operations in ascending UUID byte order, which
//! removes the classic two-account deadlock), appends per-participant
//! ledger rows, bumps the per-player event sequence, and stages
//! `BalanceChanged` events that reach the bus only after the commit
//! returns.

use crate::errors::{with_retry, CoreError, CoreResult, ErrorCode};
use crate::idempotency::{self, apply_idempotent, IdemOutcome, IdemWork, DEFAULT_TTL_SECS};
use crate::ledger::{canonical_reason, insert_entry, LedgerEntry, LedgerMirror, NewLedgerEntry};
use crate::metrics::CoreMetrics;
use crate::pool::Db;
use crate::now_ts;
use coffer_events::{BalanceChanged, EventBus, EVENT_VERSION};
use sqlx::{MySql, Row, Transaction};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const MODULE_WALLET: &str = "core.wallet";

const SCOPE_DEPOSIT: &str = "wallet:deposit";
const SCOPE_WITHDRAW: &str = "wallet:withdraw";
const SCOPE_TRANSFER: &str = "wallet:transfer";

/// One participant's committed balance movement.
#[derive(Debug, Clone, Copy)]
pub struct BalanceChange {
    pub uuid: Uuid,
    pub seq: u64,
    pub old_units: i64,
    pub new_units: i64,
}

/// Result of a successful wallet operation. `replay` means the identical
/// request already committed once; no new side effects were produced.
#[derive(Debug, Clone, Default)]
pub struct WalletReceipt {
    pub replay: bool,
    pub changes: Vec<BalanceChange>,
}

#[derive(Clone)]
pub struct Wallet {
    db: Db,
    bus: Option<EventBus>,
    mirror: Option<Arc<LedgerMirror>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Deposit,
    Withdraw,
    Transfer,
}

impl OpKind {
    fn op_str(&self) -> &'static str {
        match self {
            OpKind::Deposit => "deposit",
            OpKind::Withdraw => "withdraw",
            OpKind::Transfer => "transfer",
        }
    }
}

#[derive(Clone)]
struct OpSpec {
    kind: OpKind,
    op: &'static str,
    scope: &'static str,
    module_id: String,
    from: Option<Uuid>,
    to: Option<Uuid>,
    amount: i64,
    reason: String,
    key: String,
    payload_hash: [u8; 32],
    server_node: Option<String>,
}

#[derive(Default)]
struct WorkOut {
    changes: Vec<BalanceChange>,
    entries: Vec<LedgerEntry>,
}

impl Wallet {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            bus: None,
            mirror: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<LedgerMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Credit `to`. `key` makes the call replay-safe; without it an
    /// internal auto-key is synthesized and no replay is possible.
    pub async fn deposit(
        &self,
        module_id: &str,
        to: Uuid,
        amount: i64,
        reason: &str,
        key: Option<&str>,
    ) -> CoreResult<WalletReceipt> {
        self.run(OpKind::Deposit, module_id, None, Some(to), amount, reason, key)
            .await
    }

    /// Debit `from`; refuses to take the balance below zero.
    pub async fn withdraw(
        &self,
        module_id: &str,
        from: Uuid,
        amount: i64,
        reason: &str,
        key: Option<&str>,
    ) -> CoreResult<WalletReceipt> {
        self.run(OpKind::Withdraw, module_id, Some(from), None, amount, reason, key)
            .await
    }

    /// Atomic withdraw+deposit. Self-transfer is a no-op success.
    pub async fn transfer(
        &self,
        module_id: &str,
        from: Uuid,
        to: Uuid,
        amount: i64,
        reason: &str,
        key: Option<&str>,
    ) -> CoreResult<WalletReceipt> {
        self.run(
            OpKind::Transfer,
            module_id,
            Some(from),
            Some(to),
            amount,
            reason,
            key,
        )
        .await
    }

    async fn run(
        &self,
        kind: OpKind,
        module_id: &str,
        from: Option<Uuid>,
        to: Option<Uuid>,
        amount: i64,
        reason: &str,
        key: Option<&str>,
    ) -> CoreResult<WalletReceipt> {
        let (op, scope) = match kind {
            OpKind::Deposit => ("wallet.deposit", SCOPE_DEPOSIT),
            OpKind::Withdraw => ("wallet.withdraw", SCOPE_WITHDRAW),
            OpKind::Transfer => ("wallet.transfer", SCOPE_TRANSFER),
        };
        let started = Instant::now();

        let result = self
            .run_inner(kind, op, scope, module_id, from, to, amount, reason, key)
            .await;

        self.db.observe_query(op, started);
        match &result {
            Ok(_) => CoreMetrics::incr(self.ok_counter(kind)),
            Err(_) => CoreMetrics::incr(self.err_counter(kind)),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        kind: OpKind,
        op: &'static str,
        scope: &'static str,
        module_id: &str,
        from: Option<Uuid>,
        to: Option<Uuid>,
        amount: i64,
        reason: &str,
        key: Option<&str>,
    ) -> CoreResult<WalletReceipt> {
        self.db.guard_write(op)?;

        if amount < 0 {
            return Err(CoreError::new(
                ErrorCode::InvalidAmount,
                op,
                format!("amount must be >= 0, got {amount}"),
            ));
        }
        if from.map_or(false, |u| u.is_nil()) || to.map_or(false, |u| u.is_nil()) {
            return Err(CoreError::new(
                ErrorCode::UnknownPlayer,
                op,
                "nil participant",
            ));
        }

        let reason = canonical_reason(reason);
        let key = match key {
            Some(k) => k.to_string(),
            // Synthesized keys are unique per call; a retry of the same
            // logical request from the host cannot replay without a key.
            None => format!("auto:{}", Uuid::new_v4()),
        };
        let payload = canonical_payload(scope, from, to, amount, &reason);
        let payload_hash = idempotency::hash_payload(&payload);

        let spec = OpSpec {
            kind,
            op,
            scope,
            module_id: module_id.chars().take(64).collect(),
            from,
            to,
            amount,
            reason,
            key,
            payload_hash,
            server_node: self.db.server_node().map(str::to_string),
        };

        with_retry(op, || self.execute(spec.clone())).await
    }

    async fn execute(&self, spec: OpSpec) -> CoreResult<WalletReceipt> {
        let op = spec.op;
        let work_spec = spec.clone();
        let work_db = self.db.clone();
        let work: IdemWork<'_, WorkOut> = Box::new(move |tx| {
            Box::pin(async move { apply_mutation(tx, &work_db, work_spec).await })
        });

        let outcome = apply_idempotent(
            &self.db,
            spec.scope,
            &spec.key,
            spec.payload_hash,
            DEFAULT_TTL_SECS,
            work,
        )
        .await;

        match outcome {
            IdemOutcome::Success(out) => {
                self.emit(&spec, &out);
                Ok(WalletReceipt {
                    replay: false,
                    changes: out.changes,
                })
            }
            IdemOutcome::Replay => Ok(WalletReceipt {
                replay: true,
                changes: Vec::new(),
            }),
            IdemOutcome::Mismatch => Err(CoreError::new(
                ErrorCode::IdempotencyMismatch,
                op,
                format!("key {:?} was used with a different payload", spec.key),
            )),
            IdemOutcome::WorkFailed(e) => Err(e),
            IdemOutcome::DbError(e) => Err(e),
        }
    }

    /// Post-commit side channel: the transaction is durable by the time
    /// this runs, so delivery failures can no longer affect the ledger.
    fn emit(&self, spec: &OpSpec, out: &WorkOut) {
        if let Some(bus) = &self.bus {
            for change in &out.changes {
                let accepted = bus.publish(BalanceChanged {
                    uuid: change.uuid,
                    seq: change.seq,
                    old_units: change.old_units,
                    new_units: change.new_units,
                    reason: spec.reason.clone(),
                    version: EVENT_VERSION,
                });
                if accepted {
                    CoreMetrics::incr(&self.db.metrics().events_published);
                } else {
                    CoreMetrics::incr(&self.db.metrics().events_dropped);
                }
            }
        }
        if let Some(mirror) = &self.mirror {
            for entry in &out.entries {
                if let Err(e) = mirror.append(entry) {
                    tracing::warn!(op = spec.op, error = %e, "ledger file mirror append failed");
                }
            }
        }
    }

    fn ok_counter(&self, kind: OpKind) -> &std::sync::atomic::AtomicU64 {
        match kind {
            OpKind::Deposit => &self.db.metrics().deposit_ok,
            OpKind::Withdraw => &self.db.metrics().withdraw_ok,
            OpKind::Transfer => &self.db.metrics().transfer_ok,
        }
    }

    fn err_counter(&self, kind: OpKind) -> &std::sync::atomic::AtomicU64 {
        match kind {
            OpKind::Deposit => &self.db.metrics().deposit_err,
            OpKind::Withdraw => &self.db.metrics().withdraw_err,
            OpKind::Transfer => &self.db.metrics().transfer_err,
        }
    }
}

/// `scope | fromUuidOrZero | toUuidOrZero | amount | canonicalReason`.
/// The hash of this string is the tie-breaker that distinguishes replays
/// from key-collision mistakes.
pub fn canonical_payload(
    scope: &str,
    from: Option<Uuid>,
    to: Option<Uuid>,
    amount: i64,
    canonical_reason: &str,
) -> String {
    let zero = Uuid::nil();
    format!(
        "{scope}|{}|{}|{amount}|{canonical_reason}",
        from.unwrap_or(zero),
        to.unwrap_or(zero)
    )
}

async fn apply_mutation(
    tx: &mut Transaction<'static, MySql>,
    db: &Db,
    spec: OpSpec,
) -> CoreResult<WorkOut> {
    let op = spec.op;
    let now = now_ts();

    match spec.kind {
        OpKind::Deposit => {
            let to = spec.to.ok_or_else(|| missing_participant(op))?;
            let old = lock_balance(tx, db, op, to).await?;
            let new = old.checked_add(spec.amount).ok_or_else(|| {
                CoreError::new(ErrorCode::InvalidAmount, op, "balance overflow")
            })?;
            let change = commit_change(tx, db, &spec, to, old, new, spec.amount, now).await?;
            Ok(WorkOut {
                changes: vec![change.0],
                entries: vec![change.1],
            })
        }
        OpKind::Withdraw => {
            let from = spec.from.ok_or_else(|| missing_participant(op))?;
            let old = lock_balance(tx, db, op, from).await?;
            let new = old - spec.amount;
            if new < 0 {
                return Err(CoreError::new(
                    ErrorCode::InsufficientFunds,
                    op,
                    format!("balance {old} is short of {}", spec.amount),
                ));
            }
            let change = commit_change(tx, db, &spec, from, old, new, -spec.amount, now).await?;
            Ok(WorkOut {
                changes: vec![change.0],
                entries: vec![change.1],
            })
        }
        OpKind::Transfer => {
            let from = spec.from.ok_or_else(|| missing_participant(op))?;
            let to = spec.to.ok_or_else(|| missing_participant(op))?;
            if from == to {
                // Self-transfer: success with no effect.
                return Ok(WorkOut::default());
            }

            // Lock both rows in ascending byte order, then re-associate.
            let (first, second) = if from.as_bytes() <= to.as_bytes() {
                (from, to)
            } else {
                (to, from)
            };
            let first_bal = lock_balance(tx, db, op, first).await?;
            let second_bal = lock_balance(tx, db, op, second).await?;
            let (from_bal, to_bal) = if first == from {
                (first_bal, second_bal)
            } else {
                (second_bal, first_bal)
            };

            let new_from = from_bal - spec.amount;
            if new_from < 0 {
                return Err(CoreError::new(
                    ErrorCode::InsufficientFunds,
                    op,
                    format!("balance {from_bal} is short of {}", spec.amount),
                ));
            }
            let new_to = to_bal.checked_add(spec.amount).ok_or_else(|| {
                CoreError::new(ErrorCode::InvalidAmount, op, "balance overflow")
            })?;

            let debit =
                commit_change(tx, db, &spec, from, from_bal, new_from, -spec.amount, now).await?;
            let credit =
                commit_change(tx, db, &spec, to, to_bal, new_to, spec.amount, now).await?;
            Ok(WorkOut {
                changes: vec![debit.0, credit.0],
                entries: vec![debit.1, credit.1],
            })
        }
    }
}

fn missing_participant(op: &'static str) -> CoreError {
    CoreError::new(ErrorCode::UnknownPlayer, op, "participant not provided")
}

/// `SELECT balance FOR UPDATE`; an absent row is `UNKNOWN_PLAYER`.
async fn lock_balance(
    tx: &mut Transaction<'static, MySql>,
    db: &Db,
    op: &'static str,
    player: Uuid,
) -> CoreResult<i64> {
    let row = sqlx::query("SELECT balance FROM players WHERE uuid = ? FOR UPDATE")
        .bind(&player.as_bytes()[..])
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| db.fail(op, e))?;
    match row {
        Some(row) => row
            .try_get::<i64, _>("balance")
            .map_err(|e| db.fail(op, e)),
        None => Err(CoreError::new(
            ErrorCode::UnknownPlayer,
            op,
            format!("player {player} does not exist"),
        )),
    }
}

/// Write one participant's new balance, bump their event seq, and append
/// the ledger row. Returns the staged change plus the full entry for the
/// post-commit mirror.
#[allow(clippy::too_many_arguments)]
async fn commit_change(
    tx: &mut Transaction<'static, MySql>,
    db: &Db,
    spec: &OpSpec,
    player: Uuid,
    old: i64,
    new: i64,
    delta: i64,
    now: u64,
) -> CoreResult<(BalanceChange, LedgerEntry)> {
    let op = spec.op;

    sqlx::query("UPDATE players SET balance = ?, updated_at = ? WHERE uuid = ?")
        .bind(new)
        .bind(now)
        .bind(&player.as_bytes()[..])
        .execute(&mut **tx)
        .await
        .map_err(|e| db.fail(op, e))?;

    let seq = bump_event_seq(tx, db, op, player).await?;

    let new_entry = NewLedgerEntry {
        ts: now,
        module_id: spec.module_id.clone(),
        op: spec.kind.op_str().to_string(),
        from_uuid: spec.from,
        to_uuid: spec.to,
        amount: delta,
        reason: spec.reason.clone(),
        seq,
        idem_scope: Some(spec.scope.to_string()),
        idem_key_hash: Some(idempotency::hash_key(&spec.key)),
        old_units: old,
        new_units: new,
        server_node: spec.server_node.clone(),
        extra_json: None,
    };
    let id = insert_entry_returning_id(tx, &new_entry)
        .await
        .map_err(|e| db.fail(op, e))?;

    Ok((
        BalanceChange {
            uuid: player,
            seq,
            old_units: old,
            new_units: new,
        },
        LedgerEntry {
            id,
            ts: new_entry.ts,
            module_id: new_entry.module_id.clone(),
            op: new_entry.op.clone(),
            from_uuid: new_entry.from_uuid,
            to_uuid: new_entry.to_uuid,
            amount: new_entry.amount,
            reason: new_entry.reason.clone(),
            ok: true,
            code: None,
            seq,
            old_units: Some(old),
            new_units: Some(new),
            server_node: new_entry.server_node.clone(),
            extra_json: None,
        },
    ))
}

async fn insert_entry_returning_id(
    tx: &mut Transaction<'static, MySql>,
    entry: &NewLedgerEntry,
) -> Result<u64, sqlx::Error> {
    insert_entry(tx, entry).await?;
    let id: u64 = sqlx::query_scalar("SELECT LAST_INSERT_ID()")
        .fetch_one(&mut **tx)
        .await?;
    Ok(id)
}

/// Insert-or-increment, returning the new value, in one atomic statement.
async fn bump_event_seq(
    tx: &mut Transaction<'static, MySql>,
    db: &Db,
    op: &'static str,
    player: Uuid,
) -> CoreResult<u64> {
    let res = sqlx::query(
        r#"
        INSERT INTO player_event_seq (uuid, seq)
        VALUES (?, LAST_INSERT_ID(1))
        ON DUPLICATE KEY UPDATE seq = LAST_INSERT_ID(seq + 1)
        "#,
    )
    .bind(&player.as_bytes()[..])
    .execute(&mut **tx)
    .await
    .map_err(|e| db.fail(op, e))?;
    Ok(res.last_insert_id())
}
