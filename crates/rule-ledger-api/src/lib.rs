use std::fmt::Write as _;
use std::path::Path;

use rule_ledger_core::{
    allocate_between, gap_contains, needs_renormalization, renormalize_plan, Anchor, LedgerError,
    OrderKey, Rule, RuleId, RulePayload,
};
use rule_ledger_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, WriteOp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Version tag stamped into every service envelope that carries data
/// produced by this crate.
pub const API_CONTRACT_VERSION: &str = "rules-api.v1";

/// Bounded retry budget for writes that lose the optimistic revision race.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Upper bound on the page size a single listing call may request.
pub const MAX_PAGE_SIZE: u64 = 500;

/// Where a newly created rule lands in the evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    First,
    Last,
    Before(RuleId),
}

/// Destination of a reorder. `Before(sentinel)` and `End` are the same
/// position; both mean "after every real rule".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveTarget {
    Before(RuleId),
    End,
}

#[derive(Debug, Clone, Copy)]
enum GapSpec {
    First,
    Before(RuleId),
    End,
}

/// One row of a listing page. The terminal entry is virtual; it closes the
/// final page so clients always see an explicit end of the order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageEntry {
    Rule {
        #[serde(flatten)]
        rule: Rule,
        display_priority: u64,
    },
    Terminal {
        display_priority: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RulePage {
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub entries: Vec<PageEntry>,
    /// Fingerprint of the (id, key) pairs on this page. Two reads with the
    /// same fingerprint observed the same ordering for these rows.
    pub snapshot: String,
}

/// Ordering engine over a rule store. All writes go through the store's
/// revision-guarded transaction; on a lost race the operation re-reads its
/// neighbors and retries a bounded number of times.
pub struct RuleLedgerApi {
    store: SqliteStore,
}

impl RuleLedgerApi {
    /// Open a ledger at `path`, applying pending migrations.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the database cannot be
    /// opened or migrated.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let mut store = SqliteStore::open(path)?;
        store.migrate()?;
        Ok(Self { store })
    }

    /// Wrap an already-migrated store.
    #[must_use]
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Create a rule at the requested position.
    ///
    /// A key is allocated inside the target gap before the insert commits.
    /// When the gap cannot hold another key the whole collection is
    /// renormalized and the allocation is retried; callers never see the
    /// intermediate exhaustion.
    ///
    /// # Errors
    /// [`LedgerError::Validation`] for a malformed payload,
    /// [`LedgerError::NotFound`] when `Before` names an absent rule,
    /// [`LedgerError::Conflict`] when every retry lost the revision race.
    pub fn create_rule(
        &mut self,
        payload: RulePayload,
        placement: Placement,
    ) -> Result<Rule, LedgerError> {
        payload.validate()?;
        let spec = match placement {
            Placement::First => GapSpec::First,
            Placement::Last => GapSpec::End,
            Placement::Before(id) if id.is_sentinel() => GapSpec::End,
            Placement::Before(id) => GapSpec::Before(id),
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let revision = self.store.revision()?;
            let (lower, upper) = self.resolve_gap(spec, None)?;
            let key = match allocate_between(lower, upper) {
                Ok(key) => key,
                Err(LedgerError::Exhausted { .. }) => {
                    self.recover_exhausted()?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let now = OffsetDateTime::now_utc();
            let rule = Rule {
                id: RuleId::new(),
                key,
                created_at: now,
                updated_at: now,
                payload: payload.clone(),
            };
            match self.store.apply(&[WriteOp::Insert { rule: rule.clone() }], revision) {
                Ok(()) => return Ok(rule),
                Err(LedgerError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(LedgerError::Conflict)
    }

    /// Move an existing rule before another rule or to the end of the order.
    ///
    /// Only the moved rule's key changes; neighbors keep theirs. Moving a
    /// rule before itself, or into a gap it already occupies, is a no-op.
    ///
    /// # Errors
    /// [`LedgerError::InvalidOperation`] for the terminal row,
    /// [`LedgerError::NotFound`] for an absent rule or target,
    /// [`LedgerError::Conflict`] when every retry lost the revision race.
    pub fn move_rule(&mut self, id: RuleId, target: MoveTarget) -> Result<Rule, LedgerError> {
        if id.is_sentinel() {
            return Err(LedgerError::InvalidOperation(
                "the terminal row always sorts last and cannot be moved".to_string(),
            ));
        }
        let spec = match target {
            MoveTarget::End => GapSpec::End,
            MoveTarget::Before(other) if other.is_sentinel() => GapSpec::End,
            MoveTarget::Before(other) if other == id => return self.store.get(id),
            MoveTarget::Before(other) => GapSpec::Before(other),
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let revision = self.store.revision()?;
            let current = self.store.get(id)?;
            let (lower, upper) = self.resolve_gap(spec, Some(id))?;
            if gap_contains(lower, upper, current.key) {
                return Ok(current);
            }
            let key = match allocate_between(lower, upper) {
                Ok(key) => key,
                Err(LedgerError::Exhausted { .. }) => {
                    self.recover_exhausted()?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self.store.apply(&[WriteOp::UpdateKey { id, key }], revision) {
                Ok(()) => return self.store.get(id),
                Err(LedgerError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(LedgerError::Conflict)
    }

    /// Replace a rule's payload without touching its position.
    ///
    /// # Errors
    /// [`LedgerError::Validation`], [`LedgerError::NotFound`],
    /// [`LedgerError::Conflict`] as for the other write operations.
    pub fn update_rule(&mut self, id: RuleId, payload: RulePayload) -> Result<Rule, LedgerError> {
        payload.validate()?;
        if id.is_sentinel() {
            return Err(LedgerError::InvalidOperation(
                "the terminal row has no payload to edit".to_string(),
            ));
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let revision = self.store.revision()?;
            let op = WriteOp::UpdatePayload { id, payload: payload.clone() };
            match self.store.apply(&[op], revision) {
                Ok(()) => return self.store.get(id),
                Err(LedgerError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(LedgerError::Conflict)
    }

    /// Delete a rule. Neighbors keep their keys; the surrounding gap simply
    /// widens.
    ///
    /// # Errors
    /// [`LedgerError::InvalidOperation`] for the terminal row,
    /// [`LedgerError::NotFound`], [`LedgerError::Conflict`].
    pub fn delete_rule(&mut self, id: RuleId) -> Result<(), LedgerError> {
        if id.is_sentinel() {
            return Err(LedgerError::InvalidOperation(
                "the terminal row cannot be deleted".to_string(),
            ));
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let revision = self.store.revision()?;
            match self.store.apply(&[WriteOp::Delete { id }], revision) {
                Ok(()) => return Ok(()),
                Err(LedgerError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(LedgerError::Conflict)
    }

    /// # Errors
    /// [`LedgerError::NotFound`] when the id is absent.
    pub fn get_rule(&self, id: RuleId) -> Result<Rule, LedgerError> {
        self.store.get(id)
    }

    /// Full collection in evaluation order.
    ///
    /// # Errors
    /// [`LedgerError::StoreUnavailable`] on a read failure.
    pub fn list_rules(&self) -> Result<Vec<Rule>, LedgerError> {
        self.store.list_range(None, None)
    }

    /// # Errors
    /// [`LedgerError::StoreUnavailable`] on a read failure.
    pub fn count_rules(&self) -> Result<u64, LedgerError> {
        self.store.count()
    }

    /// One page of the collection in evaluation order, reached by key-range
    /// hops so deleted or renumbered rows between reads shift the page
    /// boundaries instead of producing duplicates.
    ///
    /// The terminal entry appears only on the final page (including page 1 of
    /// an empty collection). Pages past the end come back empty.
    ///
    /// # Errors
    /// [`LedgerError::Validation`] for a zero page or an out-of-range page
    /// size, [`LedgerError::StoreUnavailable`] on read failures.
    pub fn list_page(&self, page: u64, page_size: u64) -> Result<RulePage, LedgerError> {
        if page == 0 {
            return Err(LedgerError::Validation("page numbers start at 1".to_string()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(LedgerError::Validation(format!(
                "page size MUST be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let total = self.store.count()?;
        let limit = usize::try_from(page_size).unwrap_or(usize::MAX);

        let mut after: Option<OrderKey> = None;
        for _ in 1..page {
            let hop = self.store.list_range(after, Some(limit))?;
            if hop.len() < limit {
                return Ok(RulePage {
                    page,
                    page_size,
                    total,
                    entries: Vec::new(),
                    snapshot: page_snapshot(&[]),
                });
            }
            after = hop.last().map(|rule| rule.key);
        }

        let rules = self.store.list_range(after, Some(limit))?;
        let is_final = match rules.last() {
            Some(last) => self.store.list_range(Some(last.key), Some(1))?.is_empty(),
            None => after.is_none(),
        };

        let snapshot = page_snapshot(&rules);
        let base = (page - 1) * page_size;
        let mut entries = Vec::with_capacity(rules.len() + 1);
        let mut position = base;
        for rule in rules {
            position += 1;
            entries.push(PageEntry::Rule { rule, display_priority: position });
        }
        if is_final {
            entries.push(PageEntry::Terminal { display_priority: total + 1 });
        }

        Ok(RulePage { page, page_size, total, entries, snapshot })
    }

    /// Renumber the whole collection to evenly spaced keys, preserving the
    /// relative order, as one atomic write.
    ///
    /// # Errors
    /// [`LedgerError::Conflict`] when every retry lost the revision race,
    /// [`LedgerError::StoreUnavailable`] on storage failures.
    pub fn renormalize(&mut self) -> Result<usize, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            match self.run_renormalize() {
                Ok(count) => return Ok(count),
                Err(LedgerError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(LedgerError::Conflict)
    }

    /// Renormalize only when some adjacent gap has collapsed. Returns whether
    /// a renumbering ran.
    ///
    /// # Errors
    /// As for [`Self::renormalize`].
    pub fn renormalize_if_needed(&mut self) -> Result<bool, LedgerError> {
        let rules = self.store.list_range(None, None)?;
        let keys: Vec<OrderKey> = rules.iter().map(|rule| rule.key).collect();
        if needs_renormalization(&keys) {
            self.renormalize()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current revision stamp of the collection.
    ///
    /// # Errors
    /// [`LedgerError::StoreUnavailable`] on a read failure.
    pub fn revision(&self) -> Result<i64, LedgerError> {
        self.store.revision()
    }

    /// # Errors
    /// [`LedgerError::StoreUnavailable`] when a probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, LedgerError> {
        self.store.integrity_check()
    }

    /// # Errors
    /// [`LedgerError::StoreUnavailable`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, LedgerError> {
        self.store.schema_status()
    }

    /// # Errors
    /// [`LedgerError::StoreUnavailable`] when the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), LedgerError> {
        self.store.backup_database(out_file)
    }

    /// # Errors
    /// [`LedgerError::StoreUnavailable`] when the restore or the follow-up
    /// migration fails.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<(), LedgerError> {
        self.store.restore_database(in_file)
    }

    fn resolve_gap(
        &self,
        spec: GapSpec,
        exclude: Option<RuleId>,
    ) -> Result<(Anchor, Anchor), LedgerError> {
        match spec {
            GapSpec::First => {
                let first = self.store.list_range(None, Some(1))?;
                let upper = first.first().map_or(Anchor::End, |rule| Anchor::Key(rule.key));
                Ok((Anchor::Start, upper))
            }
            GapSpec::End => {
                let lower = self
                    .store
                    .last(exclude)?
                    .map_or(Anchor::Start, |rule| Anchor::Key(rule.key));
                Ok((lower, Anchor::End))
            }
            GapSpec::Before(target_id) => {
                let target = self.store.get(target_id)?;
                let lower = self
                    .store
                    .predecessor(target.key, exclude)?
                    .map_or(Anchor::Start, |rule| Anchor::Key(rule.key));
                Ok((lower, Anchor::Key(target.key)))
            }
        }
    }

    // A concurrent writer may renormalize first; in that case the gap is
    // already wide again and losing the race here is fine.
    fn recover_exhausted(&mut self) -> Result<(), LedgerError> {
        match self.run_renormalize() {
            Ok(_) | Err(LedgerError::Conflict) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn run_renormalize(&mut self) -> Result<usize, LedgerError> {
        let revision = self.store.revision()?;
        let rules = self.store.list_range(None, None)?;
        let ids: Vec<RuleId> = rules.iter().map(|rule| rule.id).collect();
        let ops: Vec<WriteOp> = renormalize_plan(&ids)
            .into_iter()
            .map(|(id, key)| WriteOp::UpdateKey { id, key })
            .collect();
        if ops.is_empty() {
            return Ok(0);
        }
        let count = ops.len();
        self.store.apply(&ops, revision)?;
        Ok(count)
    }
}

fn page_snapshot(rules: &[Rule]) -> String {
    let mut hasher = Sha256::new();
    for rule in rules {
        hasher.update(rule.id.to_string().as_bytes());
        hasher.update(rule.key.value().to_bits().to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        let _ = write!(hex, "{byte:02x}");
    }
    format!("page_{hex}")
}
