//! Hold lifecycle: create, capture, reverse, extend.
//!
//! A hold reserves spend intent with a deadline. `open → captured` and
//! `open → reversed` are the only transitions, both terminal; every
//! mutation re-reads the row, composes the update with `version + 1` and an
//! appended audit entry, then writes through the store's conditional update
//! guarded on `(version, state = open)`. Exactly one of two concurrent
//! attempts wins; the loser observes the conditional failure and reports a
//! zero-count summary. A captured hold is itself the permanent spend — no
//! extra DEBIT row is written.

use chrono::Duration;
use serde_json::{json, Value};
use tracing::{info, warn};

use tokenledger_core::constants::{
    HOLD_TIMEOUT_DEFAULT_SECS, HOLD_TIMEOUT_MAX_SECS, HOLD_TIMEOUT_MIN_SECS,
};
use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::time;
use tokenledger_core::transaction::{
    audit_action, audit_status, AuditEntry, HoldBreakdown, HoldState, NewTransaction, Transaction,
    TransactionType,
};
use tokenledger_core::types::{Amount, TransactionId};

use tokenledger_store::{IndexQuery, QueryOptions, RegistryStore, UpdateCondition};

use crate::split::{plan_split, usable_total, validate_sufficient_tokens};
use crate::LedgerEngine;

/// Optional knobs for [`LedgerEngine::hold_tokens`].
#[derive(Clone, Debug, Default)]
pub struct HoldOptions {
    pub ref_id: Option<String>,
    /// Seconds until the sweeper may reverse the hold. Defaults to 1800;
    /// must stay within [300, 3600].
    pub expires_after_secs: Option<i64>,
    pub purpose: Option<String>,
    pub metadata: Option<Value>,
}

/// Addressing for capture/reverse: one hold by id, or every open hold
/// sharing an external correlation id.
#[derive(Clone, Debug)]
pub enum HoldSelector {
    ById(TransactionId),
    ByRefId(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub captured_count: usize,
    pub already_captured: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReverseSummary {
    pub reversed_count: usize,
    pub already_reversed: bool,
}

/// Input to [`LedgerEngine::extend_hold_expiry`].
#[derive(Clone, Debug, Default)]
pub struct ExtendRequest {
    pub transaction_id: Option<TransactionId>,
    pub ref_id: Option<String>,
    pub extend_by_seconds: Option<i64>,
    /// Cap on `newExpiresAt - createdAt`, when given.
    pub max_total_seconds: Option<i64>,
}

/// Outcome of one conditional hold mutation.
enum Transition {
    Applied(Transaction),
    /// A concurrent actor won the row; nothing was written.
    Lost,
}

impl LedgerEngine {
    /// Reserve `amount` from `user_id` toward `beneficiary_id`.
    pub fn hold_tokens(
        &self,
        user_id: &str,
        amount: Amount,
        beneficiary_id: &str,
        opts: HoldOptions,
    ) -> Result<Transaction, LedgerError> {
        let ctx = json!({ "userId": user_id, "beneficiaryId": beneficiary_id, "amount": amount });
        if user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, ctx));
        }
        if beneficiary_id.is_empty() {
            return Err(self.fail(LedgerError::MissingBeneficiary, ctx));
        }
        if amount <= 0 {
            return Err(self.fail(LedgerError::InvalidAmount { amount }, ctx));
        }
        let expires_after = opts.expires_after_secs.unwrap_or(HOLD_TIMEOUT_DEFAULT_SECS);
        if !(HOLD_TIMEOUT_MIN_SECS..=HOLD_TIMEOUT_MAX_SECS).contains(&expires_after) {
            return Err(self.fail(
                LedgerError::InvalidHoldTimeout {
                    seconds: expires_after,
                    min: HOLD_TIMEOUT_MIN_SECS,
                    max: HOLD_TIMEOUT_MAX_SECS,
                },
                ctx,
            ));
        }

        // The one interlock at the user-aggregate level: a refId may carry
        // at most one open hold.
        if let Some(ref_id) = opts.ref_id.as_deref() {
            let existing = self
                .store()
                .query(
                    &IndexQuery::ByRefType {
                        ref_id: ref_id.to_string(),
                        transaction_type: TransactionType::Hold,
                    },
                    &QueryOptions::default(),
                )
                .map_err(|e| {
                    self.storage_failure("hold_tokens", codes::HOLD_TOKENS_ERROR, e, ctx.clone())
                })?;
            for hold in &existing {
                match hold.state {
                    Some(HoldState::Open) => {
                        return Err(self.fail(
                            LedgerError::DuplicateHoldRefId(ref_id.to_string()),
                            ctx,
                        ));
                    }
                    Some(_) => {}
                    None => self.report_missing_state(hold, codes::HOLD_MISSING_STATE),
                }
            }
        }

        let balance = self.balance_with_code(user_id, "hold_tokens", codes::HOLD_TOKENS_ERROR)?;
        if !validate_sufficient_tokens(&balance, amount, beneficiary_id) {
            return Err(self.fail(
                LedgerError::InsufficientTokens {
                    need: amount,
                    have: usable_total(&balance, beneficiary_id),
                },
                ctx,
            ));
        }
        let plan = plan_split(&balance, amount, beneficiary_id)
            .map_err(|e| self.fail(e, ctx.clone()))?;

        let now = self.clock().now();
        let expires_at = time::offset_iso(now, expires_after);
        let entry = AuditEntry {
            timestamp: time::to_iso(now),
            action: audit_action::HOLD_CREATED.to_string(),
            status: audit_status::HOLD.to_string(),
            breakdown: Some(HoldBreakdown {
                beneficiary_free_consumed: plan.beneficiary_free,
                system_free_consumed: plan.system_free,
                paid_portion_held: plan.paid,
            }),
            hold_expires_at: Some(expires_at.clone()),
            expiry_after_seconds: Some(expires_after),
            ..Default::default()
        };
        let metadata = with_audit_trail(opts.metadata, &entry)?;

        let mut request = NewTransaction::new(user_id, TransactionType::Hold, plan.paid);
        request.beneficiary_id = Some(beneficiary_id.to_string());
        request.purpose = opts.purpose;
        request.ref_id = opts.ref_id;
        request.expires_at = Some(expires_at);
        request.metadata = Some(metadata);
        request.free_beneficiary_consumed = plan.beneficiary_free;
        request.free_system_consumed = plan.system_free;

        let record = self.build_record(request)?;
        self.persist_record(&record, "hold_tokens", codes::HOLD_TOKENS_ERROR)?;
        Ok(record)
    }

    /// Capture held tokens: the reservation becomes a permanent spend.
    /// By refId this fans out across every open hold with that correlation.
    pub fn capture_held_tokens(&self, selector: HoldSelector) -> Result<CaptureSummary, LedgerError> {
        match selector {
            HoldSelector::ById(id) => {
                let hold = self.load_hold(&id, "capture_held_tokens", codes::CAPTURE_HELD_TOKENS_ERROR)?;
                match hold.state {
                    Some(HoldState::Captured) => {
                        Ok(CaptureSummary { captured_count: 0, already_captured: true })
                    }
                    Some(HoldState::Reversed) => Err(self.fail(
                        LedgerError::AlreadyReversed(id.as_str().to_string()),
                        json!({ "transactionId": id.as_str() }),
                    )),
                    Some(HoldState::Open) => {
                        match self.transition(&hold, HoldState::Captured, codes::CAPTURE_HELD_TOKENS_ERROR)? {
                            Transition::Applied(_) => {
                                Ok(CaptureSummary { captured_count: 1, already_captured: false })
                            }
                            Transition::Lost => Ok(CaptureSummary::default()),
                        }
                    }
                    None => {
                        self.report_missing_state(&hold, codes::HOLD_MISSING_STATE);
                        Err(self.fail(
                            LedgerError::NoHeldTokens(id.as_str().to_string()),
                            json!({ "transactionId": id.as_str() }),
                        ))
                    }
                }
            }
            HoldSelector::ByRefId(ref_id) => {
                let ctx = json!({ "refId": ref_id });
                let open = self.open_holds_for_ref(&ref_id, codes::CAPTURE_HELD_TOKENS_ERROR)?;
                if open.is_empty() {
                    let captured = self
                        .store()
                        .query(
                            &IndexQuery::ByRefState {
                                ref_id: ref_id.clone(),
                                state: Some(HoldState::Captured),
                            },
                            &QueryOptions::with_type(TransactionType::Hold),
                        )
                        .map_err(|e| {
                            self.storage_failure(
                                "capture_held_tokens",
                                codes::CAPTURE_HELD_TOKENS_ERROR,
                                e,
                                ctx.clone(),
                            )
                        })?;
                    if !captured.is_empty() {
                        return Ok(CaptureSummary { captured_count: 0, already_captured: true });
                    }
                    return Err(self.fail(LedgerError::NoHeldTokens(ref_id), ctx));
                }

                let mut captured_count = 0;
                for hold in &open {
                    match self.transition(hold, HoldState::Captured, codes::CAPTURE_HELD_TOKENS_ERROR)? {
                        Transition::Applied(_) => captured_count += 1,
                        Transition::Lost => {}
                    }
                }
                Ok(CaptureSummary { captured_count, already_captured: false })
            }
        }
    }

    /// Reverse held tokens: the reservation returns to the balance.
    pub fn reverse_held_tokens(&self, selector: HoldSelector) -> Result<ReverseSummary, LedgerError> {
        match selector {
            HoldSelector::ById(id) => {
                let hold = self.load_hold(&id, "reverse_held_tokens", codes::REVERSE_HELD_TOKENS_ERROR)?;
                match hold.state {
                    Some(HoldState::Reversed) => {
                        Ok(ReverseSummary { reversed_count: 0, already_reversed: true })
                    }
                    Some(HoldState::Captured) => Err(self.fail(
                        LedgerError::AlreadyCaptured(id.as_str().to_string()),
                        json!({ "transactionId": id.as_str() }),
                    )),
                    Some(HoldState::Open) => {
                        match self.transition(&hold, HoldState::Reversed, codes::REVERSE_HELD_TOKENS_ERROR)? {
                            Transition::Applied(_) => {
                                Ok(ReverseSummary { reversed_count: 1, already_reversed: false })
                            }
                            Transition::Lost => Ok(ReverseSummary::default()),
                        }
                    }
                    None => {
                        self.report_missing_state(&hold, codes::HOLD_MISSING_STATE);
                        Err(self.fail(
                            LedgerError::NoHeldTokens(id.as_str().to_string()),
                            json!({ "transactionId": id.as_str() }),
                        ))
                    }
                }
            }
            HoldSelector::ByRefId(ref_id) => {
                let open = self.open_holds_for_ref(&ref_id, codes::REVERSE_HELD_TOKENS_ERROR)?;
                let mut reversed_count = 0;
                for hold in &open {
                    match self.transition(hold, HoldState::Reversed, codes::REVERSE_HELD_TOKENS_ERROR)? {
                        Transition::Applied(_) => reversed_count += 1,
                        Transition::Lost => {}
                    }
                }
                Ok(ReverseSummary { reversed_count, already_reversed: false })
            }
        }
    }

    /// Push an open hold's deadline out by `extend_by_seconds`.
    pub fn extend_hold_expiry(&self, request: ExtendRequest) -> Result<Transaction, LedgerError> {
        let ctx = json!({
            "transactionId": request.transaction_id.as_ref().map(|id| id.as_str().to_string()),
            "refId": request.ref_id,
        });
        let extend_by = match request.extend_by_seconds {
            Some(secs) if secs > 0 => secs,
            Some(secs) => {
                return Err(self.fail(
                    LedgerError::ExtendExpiry(format!(
                        "extendBySeconds must be positive; got {secs}"
                    )),
                    ctx,
                ))
            }
            None => {
                return Err(self.fail(
                    LedgerError::ExtendExpiry("extendBySeconds is required".to_string()),
                    ctx,
                ))
            }
        };

        let hold = self.locate_extendable_hold(&request, &ctx)?;

        let old_expiry = time::parse_iso(&hold.expires_at).ok_or_else(|| {
            self.fail(
                LedgerError::ExtendExpiry(format!(
                    "hold {} has unparseable expiresAt '{}'",
                    hold.id, hold.expires_at
                )),
                ctx.clone(),
            )
        })?;
        let new_expiry = old_expiry + Duration::seconds(extend_by);
        let new_expiry_iso = time::to_iso(new_expiry);

        if let Some(max_total) = request.max_total_seconds {
            let created = time::parse_iso(&hold.created_at).ok_or_else(|| {
                self.fail(
                    LedgerError::ExtendExpiry(format!(
                        "hold {} has unparseable createdAt '{}'",
                        hold.id, hold.created_at
                    )),
                    ctx.clone(),
                )
            })?;
            let would_be = (new_expiry - created).num_seconds();
            if would_be > max_total {
                return Err(self.fail(
                    LedgerError::ExceedsMaxDuration {
                        would_be_secs: would_be,
                        max_total_secs: max_total,
                    },
                    ctx,
                ));
            }
        }

        let entry = AuditEntry {
            timestamp: self.clock().now_iso(),
            action: audit_action::EXTENDED.to_string(),
            status: audit_status::EXTENDED.to_string(),
            extended_by_seconds: Some(extend_by),
            previous_expires_at: Some(hold.expires_at.clone()),
            new_expires_at: Some(new_expiry_iso.clone()),
            ..Default::default()
        };

        let mut updated = hold.clone();
        updated.expires_at = new_expiry_iso;
        updated.version = hold.version + 1;
        updated.metadata = append_audit(&hold.metadata, &entry)?;

        match self.store().update_conditional(
            &updated,
            UpdateCondition {
                expected_version: hold.version,
                expected_state: HoldState::Open,
            },
        ) {
            Ok(()) => {
                info!(
                    flag = "TOKENS",
                    action = "extend_hold_expiry",
                    tx_id = %updated.id,
                    extended_by = extend_by,
                    new_expires_at = %updated.expires_at,
                    "hold expiry extended"
                );
                Ok(updated)
            }
            Err(e) if e.is_conditional_check_failed() => Err(self.fail(
                LedgerError::AlreadyProcessed(hold.id.as_str().to_string()),
                ctx,
            )),
            Err(e) => Err(self.storage_failure(
                "extend_hold_expiry",
                codes::EXTEND_EXPIRY_ERROR,
                e,
                ctx,
            )),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn load_hold(
        &self,
        id: &TransactionId,
        op: &'static str,
        code: &'static str,
    ) -> Result<Transaction, LedgerError> {
        let ctx = json!({ "transactionId": id.as_str() });
        let record = self
            .store()
            .get(id)
            .map_err(|e| self.storage_failure(op, code, e, ctx.clone()))?
            .ok_or_else(|| {
                self.fail(LedgerError::TransactionNotFound(id.as_str().to_string()), ctx.clone())
            })?;
        if !record.is_hold() {
            return Err(self.fail(LedgerError::NoHeldTokens(id.as_str().to_string()), ctx));
        }
        Ok(record)
    }

    fn open_holds_for_ref(
        &self,
        ref_id: &str,
        code: &'static str,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.store()
            .query(
                &IndexQuery::ByRefState {
                    ref_id: ref_id.to_string(),
                    state: Some(HoldState::Open),
                },
                &QueryOptions::with_type(TransactionType::Hold),
            )
            .map_err(|e| self.storage_failure("hold_by_ref", code, e, json!({ "refId": ref_id })))
    }

    /// Apply one terminal transition under the `(version, state)` guard.
    fn transition(
        &self,
        hold: &Transaction,
        new_state: HoldState,
        code: &'static str,
    ) -> Result<Transition, LedgerError> {
        let (action, status) = match new_state {
            HoldState::Captured => (audit_action::CAPTURED, audit_status::CAPTURED),
            HoldState::Reversed => (audit_action::REVERSED, audit_status::REVERSED),
            HoldState::Open => (audit_action::HOLD_CREATED, audit_status::HOLD),
        };
        let entry = AuditEntry {
            timestamp: self.clock().now_iso(),
            action: action.to_string(),
            status: status.to_string(),
            ..Default::default()
        };

        let mut updated = hold.clone();
        updated.state = Some(new_state);
        updated.version = hold.version + 1;
        updated.metadata = append_audit(&hold.metadata, &entry)?;

        match self.store().update_conditional(
            &updated,
            UpdateCondition {
                expected_version: hold.version,
                expected_state: HoldState::Open,
            },
        ) {
            Ok(()) => {
                info!(
                    flag = "TOKENS",
                    action = "hold_transition",
                    tx_id = %updated.id,
                    user_id = %updated.user_id,
                    new_state = %new_state,
                    version = updated.version,
                    "hold transitioned"
                );
                Ok(Transition::Applied(updated))
            }
            Err(e) if e.is_conditional_check_failed() => {
                info!(
                    flag = "TOKENS",
                    action = "hold_transition",
                    tx_id = %hold.id,
                    new_state = %new_state,
                    "lost the conditional update to a concurrent actor"
                );
                Ok(Transition::Lost)
            }
            Err(e) => Err(self.storage_failure(
                "hold_transition",
                code,
                e,
                json!({ "transactionId": hold.id.as_str() }),
            )),
        }
    }

    fn locate_extendable_hold(
        &self,
        request: &ExtendRequest,
        ctx: &Value,
    ) -> Result<Transaction, LedgerError> {
        if let Some(id) = &request.transaction_id {
            let hold = self.load_hold(id, "extend_hold_expiry", codes::EXTEND_EXPIRY_ERROR)?;
            return match hold.state {
                Some(HoldState::Open) => Ok(hold),
                Some(HoldState::Captured) => Err(self.fail(
                    LedgerError::AlreadyCaptured(id.as_str().to_string()),
                    ctx.clone(),
                )),
                Some(HoldState::Reversed) => Err(self.fail(
                    LedgerError::AlreadyReversed(id.as_str().to_string()),
                    ctx.clone(),
                )),
                None => {
                    self.report_missing_state(&hold, codes::HOLD_MISSING_STATE);
                    Err(self.fail(
                        LedgerError::NoHeldTokens(id.as_str().to_string()),
                        ctx.clone(),
                    ))
                }
            };
        }

        let Some(ref_id) = request.ref_id.as_deref() else {
            return Err(self.fail(LedgerError::MissingIdentifier, ctx.clone()));
        };
        let holds = self
            .store()
            .query(
                &IndexQuery::ByRefType {
                    ref_id: ref_id.to_string(),
                    transaction_type: TransactionType::Hold,
                },
                &QueryOptions::default(),
            )
            .map_err(|e| {
                self.storage_failure(
                    "extend_hold_expiry",
                    codes::EXTEND_EXPIRY_ERROR,
                    e,
                    ctx.clone(),
                )
            })?;
        if holds.is_empty() {
            return Err(self.fail(
                LedgerError::TransactionNotFound(ref_id.to_string()),
                ctx.clone(),
            ));
        }
        if let Some(open) = holds.iter().find(|h| h.state == Some(HoldState::Open)) {
            return Ok(open.clone());
        }
        if holds.iter().any(|h| h.state == Some(HoldState::Captured)) {
            return Err(self.fail(LedgerError::AlreadyCaptured(ref_id.to_string()), ctx.clone()));
        }
        if holds.iter().any(|h| h.state == Some(HoldState::Reversed)) {
            return Err(self.fail(LedgerError::AlreadyReversed(ref_id.to_string()), ctx.clone()));
        }
        for hold in &holds {
            self.report_missing_state(hold, codes::HOLD_MISSING_STATE);
        }
        Err(self.fail(LedgerError::NoHeldTokens(ref_id.to_string()), ctx.clone()))
    }

    /// Integrity signal: a HOLD row with no state. Reported, never thrown.
    pub(crate) fn report_missing_state(&self, hold: &Transaction, code: &'static str) {
        self.sink().add_error(
            &format!("hold {} has no state field", hold.id),
            code,
            &json!({
                "transactionId": hold.id.as_str(),
                "userId": hold.user_id,
                "refId": hold.ref_id,
            }),
        );
    }
}

// ── Audit trail plumbing ─────────────────────────────────────────────────────

/// Merge the caller's metadata with a fresh one-entry audit trail.
fn with_audit_trail(metadata: Option<Value>, entry: &AuditEntry) -> Result<Value, LedgerError> {
    let mut map = match metadata {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    let entry_value = serde_json::to_value(entry)
        .map_err(|e| LedgerError::MetadataSerialization(e.to_string()))?;
    map.insert("auditTrail".to_string(), Value::Array(vec![entry_value]));
    Ok(Value::Object(map))
}

/// Append one audit entry to a hold's serialized metadata. Unparseable
/// metadata is replaced by a fresh object rather than blocking the
/// transition.
fn append_audit(metadata: &str, entry: &AuditEntry) -> Result<String, LedgerError> {
    let mut value: Value = serde_json::from_str(metadata).unwrap_or_else(|_| {
        warn!(flag = "TOKENS", "hold metadata unparseable; starting a fresh audit trail");
        json!({})
    });
    if !value.is_object() {
        value = json!({ "data": value });
    }
    let entry_value = serde_json::to_value(entry)
        .map_err(|e| LedgerError::MetadataSerialization(e.to_string()))?;
    if let Value::Object(object) = &mut value {
        match object.get_mut("auditTrail") {
            Some(Value::Array(trail)) => trail.push(entry_value),
            _ => {
                object.insert("auditTrail".to_string(), Value::Array(vec![entry_value]));
            }
        }
    }
    serde_json::to_string(&value).map_err(|e| LedgerError::MetadataSerialization(e.to_string()))
}
