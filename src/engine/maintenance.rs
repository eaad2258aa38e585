impl SyncEngine {
    /// Startup sweep after a process restart.
    ///
    /// Rows left executing were interrupted, not failed: they go back to the
    /// pending pool with their retry count unchanged. Rows that already have
    /// an authority id finish reconciliation.
    async fn recover(&self) -> Result<()> {
        let flight = self.flight.lock().await;
        let interrupted = self.store.lock().await.reset_interrupted().await?;
        for id in &interrupted {
            event!(
                Level::WARN,
                mutation_id = %id,
                "mutation interrupted by restart; returned to pending"
            );
        }

        let resumed = self.resume_reconciliation(&flight).await?;
        event!(
            Level::INFO,
            interrupted = interrupted.len(),
            reconciliations_resumed = resumed,
            "queue recovery finished"
        );
        Ok(())
    }

    /// Finishes reconciliations cut short by a crash or a local store error.
    async fn resume_reconciliation(&self, _flight: &MutexGuard<'_, ()>) -> Result<usize> {
        let (reconciling, reconciled) = {
            let store = self.store.lock().await;
            (store.list_reconciling(), store.list_reconciled())
        };

        for mutation in &reconciled {
            self.store
                .lock()
                .await
                .remove(&mutation.id, "reconciled")
                .await?;
        }

        let mut resumed = 0usize;
        for mutation in reconciling {
            if self.reconcile(mutation).await? == ExecutionOutcome::ReconciliationDeferred {
                break;
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Retention sweep.
    ///
    /// Removes quarantined mutations older than `retention_days` and returns
    /// rows executing longer than the configured bound to the pending pool,
    /// treating them as crashed rather than failed.
    pub async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport> {
        let now = Utc::now();
        let purged_quarantined = self
            .quarantine
            .purge_created_before(
                now.checked_sub_signed(Duration::days(i64::from(retention_days)))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            )
            .await?;

        let max_execution_ms = i64::try_from(self.policy.drain.max_execution_ms).unwrap_or(i64::MAX);
        let stuck_cutoff = now
            .checked_sub_signed(Duration::milliseconds(max_execution_ms))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reset = self.store.lock().await.reset_stuck(stuck_cutoff).await?;
        for id in &reset {
            event!(Level::WARN, mutation_id = %id, "stuck mutation returned to pending");
        }

        let report = CleanupReport {
            purged_quarantined,
            reset_stuck: reset.len(),
        };
        event!(
            Level::INFO,
            purged_quarantined = report.purged_quarantined,
            reset_stuck = report.reset_stuck,
            "queue cleanup finished"
        );
        Ok(report)
    }
}
