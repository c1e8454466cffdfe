//! sled-backed registry store.
//!
//! Named trees:
//!   token_registry         — id bytes                          → bincode(Transaction)
//!   token_registry_archive — id bytes                          → bincode(Transaction)
//!   idx_user_created       — userId ∘ createdAt ∘ id           → id bytes
//!   idx_beneficiary_created— beneficiaryId ∘ createdAt ∘ id    → id bytes
//!   idx_user_ref           — userId ∘ refId ∘ id               → id bytes
//!   idx_ref_state          — refId ∘ state ∘ id                → id bytes
//!   idx_ref_type           — refId ∘ type ∘ id                 → id bytes
//!   idx_user_expires       — userId ∘ expiresAt ∘ id           → id bytes
//!   idx_expires            — expiresAt ∘ id                    → id bytes
//!
//! `∘` is a 0x00 separator. ISO instants sort lexicographically in
//! chronological order, so index range scans double as time ranges. Rows
//! with no hold state index under the literal component `none` so that
//! corrupted holds stay visible to the read paths that report them.
//!
//! Conditional updates are sled `compare_and_swap` over the full serialized
//! record: any concurrent mutation changes the bytes, so the swap fails
//! exactly when the `(version, state)` condition no longer holds.

use std::path::Path;

use tokenledger_core::constants::{
    INDEX_BENEFICIARY_CREATED, INDEX_EXPIRES, INDEX_REF_STATE, INDEX_REF_TYPE, INDEX_USER_CREATED,
    INDEX_USER_EXPIRES, INDEX_USER_REF, TOKEN_REGISTRY_ARCHIVE_TABLE, TOKEN_REGISTRY_TABLE,
};
use tokenledger_core::transaction::Transaction;
use tokenledger_core::types::TransactionId;

use crate::gateway::{
    IndexQuery, QueryOptions, RegistryStore, ScanPage, StoreError, UpdateCondition,
};

const SEP: u8 = 0x00;

/// State component used in `idx_ref_state` keys for rows with no state.
const STATE_NONE: &str = "none";

fn composite(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Prefix matching every key whose leading components equal `parts`.
fn composite_prefix(parts: &[&str]) -> Vec<u8> {
    let mut key = composite(parts);
    key.push(SEP);
    key
}

pub struct RegistryDb {
    _db: sled::Db,
    primary: sled::Tree,
    archive: sled::Tree,
    idx_user_created: sled::Tree,
    idx_beneficiary_created: sled::Tree,
    idx_user_ref: sled::Tree,
    idx_ref_state: sled::Tree,
    idx_ref_type: sled::Tree,
    idx_user_expires: sled::Tree,
    idx_expires: sled::Tree,
}

impl RegistryDb {
    /// Open or create the registry database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(storage)?;
        let primary                 = db.open_tree(TOKEN_REGISTRY_TABLE).map_err(storage)?;
        let archive                 = db.open_tree(TOKEN_REGISTRY_ARCHIVE_TABLE).map_err(storage)?;
        let idx_user_created        = db.open_tree(INDEX_USER_CREATED).map_err(storage)?;
        let idx_beneficiary_created = db.open_tree(INDEX_BENEFICIARY_CREATED).map_err(storage)?;
        let idx_user_ref            = db.open_tree(INDEX_USER_REF).map_err(storage)?;
        let idx_ref_state           = db.open_tree(INDEX_REF_STATE).map_err(storage)?;
        let idx_ref_type            = db.open_tree(INDEX_REF_TYPE).map_err(storage)?;
        let idx_user_expires        = db.open_tree(INDEX_USER_EXPIRES).map_err(storage)?;
        let idx_expires             = db.open_tree(INDEX_EXPIRES).map_err(storage)?;
        Ok(Self {
            _db: db, primary, archive, idx_user_created, idx_beneficiary_created,
            idx_user_ref, idx_ref_state, idx_ref_type, idx_user_expires, idx_expires,
        })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self._db.flush().map_err(storage)?;
        Ok(())
    }

    fn state_component(tx: &Transaction) -> &'static str {
        tx.state.map(|s| s.as_wire_str()).unwrap_or(STATE_NONE)
    }

    /// Every (tree, key) pair indexing `tx`.
    fn index_entries(&self, tx: &Transaction) -> Vec<(sled::Tree, Vec<u8>)> {
        let id = tx.id.as_str();
        vec![
            (
                self.idx_user_created.clone(),
                composite(&[&tx.user_id, &tx.created_at, id]),
            ),
            (
                self.idx_beneficiary_created.clone(),
                composite(&[&tx.beneficiary_id, &tx.created_at, id]),
            ),
            (
                self.idx_user_ref.clone(),
                composite(&[&tx.user_id, &tx.ref_id, id]),
            ),
            (
                self.idx_ref_state.clone(),
                composite(&[&tx.ref_id, Self::state_component(tx), id]),
            ),
            (
                self.idx_ref_type.clone(),
                composite(&[&tx.ref_id, tx.transaction_type.as_wire_str(), id]),
            ),
            (
                self.idx_user_expires.clone(),
                composite(&[&tx.user_id, &tx.expires_at, id]),
            ),
            (self.idx_expires.clone(), composite(&[&tx.expires_at, id])),
        ]
    }

    fn insert_index_entries(&self, tx: &Transaction) -> Result<(), StoreError> {
        for (tree, key) in self.index_entries(tx) {
            tree.insert(key, tx.id.as_bytes()).map_err(storage)?;
        }
        Ok(())
    }

    fn remove_index_entries(&self, tx: &Transaction) -> Result<(), StoreError> {
        for (tree, key) in self.index_entries(tx) {
            tree.remove(key).map_err(storage)?;
        }
        Ok(())
    }

    /// Move index entries from the shape of `old` to the shape of `new`
    /// after an in-place mutation (state or expiry changed).
    fn reindex(&self, old: &Transaction, new: &Transaction) -> Result<(), StoreError> {
        let old_entries = self.index_entries(old);
        let new_entries = self.index_entries(new);
        for ((old_tree, old_key), (_, new_key)) in old_entries.iter().zip(new_entries.iter()) {
            if old_key != new_key {
                old_tree.remove(old_key.clone()).map_err(storage)?;
                old_tree.insert(new_key.clone(), new.id.as_bytes()).map_err(storage)?;
            }
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Transaction, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn encode(tx: &Transaction) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(tx).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Fetch the primary rows behind a sequence of index values, skipping
    /// orphaned entries whose primary row is gone.
    fn resolve<I>(&self, ids: I) -> Result<Vec<Transaction>, StoreError>
    where
        I: IntoIterator<Item = Result<sled::IVec, sled::Error>>,
    {
        let mut out = Vec::new();
        for value in ids {
            let value = value.map_err(storage)?;
            let id = TransactionId::new(String::from_utf8_lossy(&value).into_owned());
            if let Some(bytes) = self.primary.get(id.as_bytes()).map_err(storage)? {
                out.push(Self::decode(&bytes)?);
            }
        }
        Ok(out)
    }

    fn run_query(&self, query: &IndexQuery) -> Result<Vec<Transaction>, StoreError> {
        match query {
            IndexQuery::ByUser { user_id } => {
                let prefix = composite_prefix(&[user_id]);
                self.resolve(self.idx_user_created.scan_prefix(prefix).values())
            }
            IndexQuery::ByBeneficiary { beneficiary_id } => {
                let prefix = composite_prefix(&[beneficiary_id]);
                self.resolve(self.idx_beneficiary_created.scan_prefix(prefix).values())
            }
            IndexQuery::ByUserRef { user_id, ref_id } => {
                let prefix = composite_prefix(&[user_id, ref_id]);
                self.resolve(self.idx_user_ref.scan_prefix(prefix).values())
            }
            IndexQuery::ByRefState { ref_id, state } => {
                let state_str = state.map(|s| s.as_wire_str()).unwrap_or(STATE_NONE);
                let prefix = composite_prefix(&[ref_id, state_str]);
                self.resolve(self.idx_ref_state.scan_prefix(prefix).values())
            }
            IndexQuery::ByRefType { ref_id, transaction_type } => {
                let prefix = composite_prefix(&[ref_id, transaction_type.as_wire_str()]);
                self.resolve(self.idx_ref_type.scan_prefix(prefix).values())
            }
            IndexQuery::ByUserExpiresBetween { user_id, from_iso, to_iso } => {
                let start = composite(&[user_id, from_iso]);
                let mut end = composite(&[user_id, to_iso]);
                end.push(0xFF);
                self.resolve(self.idx_user_expires.range(start..=end).values())
            }
            IndexQuery::ByExpiresBefore { cutoff_iso } => {
                let mut end = composite(&[cutoff_iso]);
                end.push(0xFF);
                self.resolve(self.idx_expires.range(..=end).values())
            }
        }
    }
}

impl RegistryStore for RegistryDb {
    fn put(&self, tx: &Transaction) -> Result<(), StoreError> {
        let bytes = Self::encode(tx)?;
        self.primary.insert(tx.id.as_bytes(), bytes).map_err(storage)?;
        self.insert_index_entries(tx)
    }

    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, StoreError> {
        match self.primary.get(id.as_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn query(&self, query: &IndexQuery, opts: &QueryOptions) -> Result<Vec<Transaction>, StoreError> {
        let mut records = self.run_query(query)?;
        if let Some(ty) = opts.filter_type {
            records.retain(|tx| tx.transaction_type == ty);
        }
        if let Some(state) = opts.filter_state {
            records.retain(|tx| tx.state == Some(state));
        }
        if opts.newest_first {
            records.reverse();
        }
        if let Some(limit) = opts.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn update_conditional(
        &self,
        updated: &Transaction,
        condition: UpdateCondition,
    ) -> Result<(), StoreError> {
        let current_bytes = self
            .primary
            .get(updated.id.as_bytes())
            .map_err(storage)?
            .ok_or(StoreError::ConditionalCheckFailed)?;
        let current = Self::decode(&current_bytes)?;

        if current.version != condition.expected_version
            || current.state != Some(condition.expected_state)
        {
            return Err(StoreError::ConditionalCheckFailed);
        }

        let new_bytes = Self::encode(updated)?;
        self.primary
            .compare_and_swap(
                updated.id.as_bytes(),
                Some(current_bytes),
                Some(new_bytes),
            )
            .map_err(storage)?
            .map_err(|_| StoreError::ConditionalCheckFailed)?;

        self.reindex(&current, updated)
    }

    fn delete(&self, id: &TransactionId) -> Result<(), StoreError> {
        if let Some(bytes) = self.primary.get(id.as_bytes()).map_err(storage)? {
            let tx = Self::decode(&bytes)?;
            self.remove_index_entries(&tx)?;
            self.primary.remove(id.as_bytes()).map_err(storage)?;
        }
        Ok(())
    }

    fn scan(&self, limit: usize, start_after: Option<&TransactionId>) -> Result<ScanPage, StoreError> {
        let iter: Box<dyn Iterator<Item = Result<(sled::IVec, sled::IVec), sled::Error>>> =
            match start_after {
                Some(key) => {
                    let mut start = key.as_bytes().to_vec();
                    start.push(0x00); // first key strictly after `key`
                    Box::new(self.primary.range(start..))
                }
                None => Box::new(self.primary.iter()),
            };

        let mut records = Vec::new();
        for item in iter.take(limit) {
            let (_, bytes) = item.map_err(storage)?;
            records.push(Self::decode(&bytes)?);
        }
        let last_key = if records.len() == limit {
            records.last().map(|tx| tx.id.clone())
        } else {
            None
        };
        Ok(ScanPage { records, last_key })
    }

    fn put_archive(&self, tx: &Transaction) -> Result<(), StoreError> {
        let bytes = Self::encode(tx)?;
        self.archive.insert(tx.id.as_bytes(), bytes).map_err(storage)?;
        Ok(())
    }
}

fn storage(e: sled::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenledger_core::constants::FAR_FUTURE_EXPIRY;
    use tokenledger_core::transaction::{HoldState, TransactionType};

    fn temp_db(name: &str) -> RegistryDb {
        let dir = std::env::temp_dir().join(format!("tokenledger_store_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        RegistryDb::open(&dir).expect("open temp db")
    }

    fn record(id: &str, user: &str, created_at: &str, ty: TransactionType) -> Transaction {
        Transaction {
            id: TransactionId::new(id),
            user_id: user.to_string(),
            beneficiary_id: "system".to_string(),
            transaction_type: ty,
            amount: 10,
            purpose: ty.as_wire_str().to_string(),
            ref_id: format!("no_ref_{id}"),
            expires_at: FAR_FUTURE_EXPIRY.to_string(),
            created_at: created_at.to_string(),
            metadata: "{}".to_string(),
            version: 1,
            state: if ty == TransactionType::Hold { Some(HoldState::Open) } else { None },
            free_beneficiary_consumed: 0,
            free_system_consumed: 0,
        }
    }

    #[test]
    fn put_get_round_trip() {
        let db = temp_db("round_trip");
        let tx = record("t1", "u1", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid);
        db.put(&tx).unwrap();
        let got = db.get(&tx.id).unwrap().unwrap();
        assert_eq!(got.id, tx.id);
        assert_eq!(got.amount, 10);
        assert!(db.get(&TransactionId::new("missing")).unwrap().is_none());
    }

    #[test]
    fn query_by_user_is_chronological() {
        let db = temp_db("by_user");
        db.put(&record("b", "u1", "2025-01-02T00:00:00.000Z", TransactionType::Debit)).unwrap();
        db.put(&record("a", "u1", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid)).unwrap();
        db.put(&record("c", "u2", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid)).unwrap();

        let rows = db
            .query(&IndexQuery::ByUser { user_id: "u1".into() }, &QueryOptions::default())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.as_str(), "a");
        assert_eq!(rows[1].id.as_str(), "b");

        let newest = db
            .query(
                &IndexQuery::ByUser { user_id: "u1".into() },
                &QueryOptions { newest_first: true, limit: Some(1), ..Default::default() },
            )
            .unwrap();
        assert_eq!(newest[0].id.as_str(), "b");
    }

    #[test]
    fn user_prefix_does_not_bleed_into_longer_ids() {
        let db = temp_db("prefix");
        db.put(&record("a", "u1", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid)).unwrap();
        db.put(&record("b", "u12", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid)).unwrap();
        let rows = db
            .query(&IndexQuery::ByUser { user_id: "u1".into() }, &QueryOptions::default())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id.as_str(), "a");
    }

    #[test]
    fn ref_state_index_follows_conditional_update() {
        let db = temp_db("ref_state");
        let mut hold = record("h1", "u1", "2025-01-01T00:00:00.000Z", TransactionType::Hold);
        hold.ref_id = "BK".into();
        db.put(&hold).unwrap();

        let open = db
            .query(
                &IndexQuery::ByRefState { ref_id: "BK".into(), state: Some(HoldState::Open) },
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(open.len(), 1);

        let mut captured = hold.clone();
        captured.state = Some(HoldState::Captured);
        captured.version = 2;
        db.update_conditional(
            &captured,
            UpdateCondition { expected_version: 1, expected_state: HoldState::Open },
        )
        .unwrap();

        let open = db
            .query(
                &IndexQuery::ByRefState { ref_id: "BK".into(), state: Some(HoldState::Open) },
                &QueryOptions::default(),
            )
            .unwrap();
        assert!(open.is_empty());
        let done = db
            .query(
                &IndexQuery::ByRefState { ref_id: "BK".into(), state: Some(HoldState::Captured) },
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].version, 2);
    }

    #[test]
    fn conditional_update_rejects_stale_version() {
        let db = temp_db("stale");
        let hold = record("h1", "u1", "2025-01-01T00:00:00.000Z", TransactionType::Hold);
        db.put(&hold).unwrap();

        let mut first = hold.clone();
        first.state = Some(HoldState::Captured);
        first.version = 2;
        db.update_conditional(
            &first,
            UpdateCondition { expected_version: 1, expected_state: HoldState::Open },
        )
        .unwrap();

        // A concurrent actor holding the stale version loses.
        let mut second = hold.clone();
        second.state = Some(HoldState::Reversed);
        second.version = 2;
        let err = db
            .update_conditional(
                &second,
                UpdateCondition { expected_version: 1, expected_state: HoldState::Open },
            )
            .unwrap_err();
        assert!(err.is_conditional_check_failed());
    }

    #[test]
    fn scan_paginates_until_exhausted() {
        let db = temp_db("scan");
        for i in 0..5 {
            db.put(&record(&format!("t{i}"), "u1", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid))
                .unwrap();
        }
        let page1 = db.scan(2, None).unwrap();
        assert_eq!(page1.records.len(), 2);
        let page2 = db.scan(2, page1.last_key.as_ref()).unwrap();
        assert_eq!(page2.records.len(), 2);
        let page3 = db.scan(2, page2.last_key.as_ref()).unwrap();
        assert_eq!(page3.records.len(), 1);
        assert!(page3.last_key.is_none());

        let mut seen: Vec<String> = page1
            .records
            .iter()
            .chain(&page2.records)
            .chain(&page3.records)
            .map(|tx| tx.id.as_str().to_string())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5, "pagination must not repeat or drop rows");
    }

    #[test]
    fn delete_removes_index_entries() {
        let db = temp_db("delete");
        let tx = record("t1", "u1", "2025-01-01T00:00:00.000Z", TransactionType::CreditPaid);
        db.put(&tx).unwrap();
        db.delete(&tx.id).unwrap();
        assert!(db.get(&tx.id).unwrap().is_none());
        let rows = db
            .query(&IndexQuery::ByUser { user_id: "u1".into() }, &QueryOptions::default())
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn expires_before_is_a_range_scan() {
        let db = temp_db("expires");
        let mut soon = record("h1", "u1", "2025-01-01T00:00:00.000Z", TransactionType::Hold);
        soon.expires_at = "2025-01-01T00:10:00.000Z".into();
        let mut later = record("h2", "u1", "2025-01-01T00:00:00.000Z", TransactionType::Hold);
        later.expires_at = "2025-06-01T00:00:00.000Z".into();
        db.put(&soon).unwrap();
        db.put(&later).unwrap();

        let due = db
            .query(
                &IndexQuery::ByExpiresBefore { cutoff_iso: "2025-02-01T00:00:00.000Z".into() },
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id.as_str(), "h1");
    }

    #[test]
    fn user_expires_between_brackets_the_window() {
        let db = temp_db("user_expires");
        for (id, exp) in [
            ("a", "2025-01-05T00:00:00.000Z"),
            ("b", "2025-01-15T00:00:00.000Z"),
            ("c", "2025-02-20T00:00:00.000Z"),
        ] {
            let mut tx = record(id, "u1", "2025-01-01T00:00:00.000Z", TransactionType::CreditFree);
            tx.expires_at = exp.into();
            db.put(&tx).unwrap();
        }
        let rows = db
            .query(
                &IndexQuery::ByUserExpiresBetween {
                    user_id: "u1".into(),
                    from_iso: "2025-01-10T00:00:00.000Z".into(),
                    to_iso: "2025-03-01T00:00:00.000Z".into(),
                },
                &QueryOptions::default(),
            )
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|tx| tx.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
