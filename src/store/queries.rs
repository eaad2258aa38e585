impl QueueStore {
    pub fn get(&self, id: &str) -> Option<QueuedMutation> {
        self.mutations.get(id).cloned()
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Option<QueuedMutation> {
        self.idempotency_index
            .get(key)
            .and_then(|id| self.mutations.get(id))
            .cloned()
    }

    /// All rows, oldest first.
    fn ordered(&self) -> Vec<&QueuedMutation> {
        let mut rows = self.mutations.values().collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
                .then(a.id.cmp(&b.id))
        });
        rows
    }

    pub fn list(&self) -> Vec<QueuedMutation> {
        self.ordered().into_iter().cloned().collect()
    }

    /// Rows that have not reached quarantine, oldest first.
    pub fn list_active(&self) -> Vec<QueuedMutation> {
        self.ordered()
            .into_iter()
            .filter(|m| !m.is_quarantined())
            .cloned()
            .collect()
    }

    pub fn list_quarantined(&self) -> Vec<QueuedMutation> {
        self.ordered()
            .into_iter()
            .filter(|m| m.is_quarantined())
            .cloned()
            .collect()
    }

    /// Rows in flight to reconciliation, left over if the process died
    /// between the authority's answer and the local update.
    pub fn list_reconciling(&self) -> Vec<QueuedMutation> {
        self.ordered()
            .into_iter()
            .filter(|m| matches!(m.state, MutationState::Reconciling { .. }))
            .cloned()
            .collect()
    }

    pub fn list_reconciled(&self) -> Vec<QueuedMutation> {
        self.ordered()
            .into_iter()
            .filter(|m| m.is_reconciled())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.mutations.values().filter(|m| !m.is_quarantined()).count()
    }

    /// Rows carrying a temp entity id the authority has not mapped yet.
    pub fn unreconciled(&self) -> Vec<QueuedMutation> {
        self.ordered()
            .into_iter()
            .filter(|m| m.awaits_reconciliation())
            .cloned()
            .collect()
    }

    pub fn reconciliation_misses(&self) -> Vec<ReconciliationMiss> {
        self.misses.iter().cloned().collect()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    pub fn subscribe_backlog(&self) -> watch::Receiver<Vec<QueuedMutation>> {
        self.backlog_tx.subscribe()
    }

    pub fn quarantine_stats(&self) -> QuarantineStats {
        let mut stats = QuarantineStats::default();
        for mutation in self.mutations.values().filter(|m| m.is_quarantined()) {
            stats.total += 1;
            *stats.by_type.entry(mutation.command_type).or_insert(0) += 1;
            stats.oldest = Some(match stats.oldest {
                Some(oldest) => oldest.min(mutation.created_at),
                None => mutation.created_at,
            });
            stats.newest = Some(match stats.newest {
                Some(newest) => newest.max(mutation.created_at),
                None => mutation.created_at,
            });
        }
        stats
    }

    pub fn stats(&self) -> QueueStats {
        let count = |predicate: fn(&QueuedMutation) -> bool| {
            self.mutations.values().filter(|m| predicate(m)).count()
        };
        QueueStats {
            pending: count(QueuedMutation::is_pending),
            executing: count(QueuedMutation::is_executing),
            reconciling: count(|m| {
                matches!(
                    m.state,
                    MutationState::Reconciling { .. } | MutationState::Reconciled { .. }
                )
            }),
            quarantined: count(QueuedMutation::is_quarantined),
            reconciliation_backlog: count(QueuedMutation::awaits_reconciliation),
            reconciliation_misses: self.misses.len(),
            next_seq: self.seq_next,
            ops_since_snapshot: self.ops_since_snapshot,
        }
    }
}
