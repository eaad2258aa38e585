impl SyncEngine {
    /// Executes the oldest pending mutation.
    ///
    /// Returns `false` when there is nothing to run or the device is offline.
    pub async fn execute_next(&self) -> Result<bool> {
        let flight = self.flight.lock().await;
        let outcome = self.step(&flight).await?;
        Ok(matches!(outcome, Some(outcome) if outcome != ExecutionOutcome::Released))
    }

    /// Executes pending mutations, returning how many succeeded.
    ///
    /// This is not a full drain that loops until [`execute_next`] returns
    /// `false`. The pass ends at the first retryable failure, released claim
    /// or deferred reconciliation, and the next pass picks that row up again.
    /// Later mutations never overtake an earlier one for the same entity.
    ///
    /// [`execute_next`]: SyncEngine::execute_next
    pub async fn drain_all(&self) -> Result<usize> {
        let flight = self.flight.lock().await;
        self.resume_reconciliation(&flight).await?;

        let throttle = TokioDuration::from_millis(self.policy.drain.throttle_ms);
        let mut succeeded = 0usize;
        let mut attempted = 0usize;
        loop {
            if attempted > 0 && !throttle.is_zero() {
                sleep(throttle).await;
            }
            let Some(outcome) = self.step(&flight).await? else {
                break;
            };
            attempted += 1;
            if outcome.is_success() {
                succeeded += 1;
            }
            if matches!(
                outcome,
                ExecutionOutcome::RetryScheduled
                    | ExecutionOutcome::Released
                    | ExecutionOutcome::ReconciliationDeferred
            ) {
                break;
            }
        }

        event!(Level::INFO, attempted, succeeded, "queue drain finished");
        Ok(succeeded)
    }

    /// Claims and runs one mutation. Requires the flight lock.
    async fn step(&self, _flight: &MutexGuard<'_, ()>) -> Result<Option<ExecutionOutcome>> {
        if !self.deps.connectivity.is_online() {
            return Ok(None);
        }

        let claimed = self.store.lock().await.claim_next().await?;
        let Some(mutation) = claimed else {
            return Ok(None);
        };

        let span = info_span!(
            "queue.execute",
            mutation_id = %mutation.id,
            command_type = %mutation.command_type,
            attempt = mutation.retry_count + 1
        );
        self.run_claimed(mutation).instrument(span).await.map(Some)
    }

    async fn run_claimed(&self, mut mutation: QueuedMutation) -> Result<ExecutionOutcome> {
        let command = match mutation.decode() {
            Ok(command) => command,
            Err(err) => {
                self.quarantine
                    .admit(mutation, format!("undecodable payload: {}", err))
                    .await?;
                return Ok(ExecutionOutcome::Quarantined);
            }
        };

        if !self.deps.connectivity.is_online() {
            mutation.release()?;
            self.store.lock().await.put(mutation).await?;
            event!(Level::DEBUG, "went offline before dispatch; claim released");
            return Ok(ExecutionOutcome::Released);
        }

        let execution = command.execute(self.deps.transport.as_ref(), self.deps.local.as_ref());
        let result = AssertUnwindSafe(execution)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                CommandResult::retryable(format!(
                    "execution panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });

        match result {
            CommandResult::Success {
                server_entity_id, ..
            } => self.complete(mutation, server_entity_id).await,
            CommandResult::Failure {
                error,
                should_retry,
            } => self.fail(mutation, error, should_retry).await,
            CommandResult::Conflict { server_data } => {
                self.resolve_conflict(mutation, server_data).await
            }
        }
    }

    async fn complete(
        &self,
        mut mutation: QueuedMutation,
        server_entity_id: Option<String>,
    ) -> Result<ExecutionOutcome> {
        match (mutation.temp_entity_id.is_some(), server_entity_id) {
            (true, Some(server_entity_id)) => {
                mutation.begin_reconciliation(server_entity_id)?;
                self.store.lock().await.put(mutation.clone()).await?;
                self.reconcile(mutation).await
            }
            _ => {
                self.store
                    .lock()
                    .await
                    .remove(&mutation.id, "executed")
                    .await?;
                event!(Level::INFO, "mutation executed");
                Ok(ExecutionOutcome::Succeeded)
            }
        }
    }

    /// Applies the authority id of a `Reconciling` row and deletes it.
    async fn reconcile(&self, mut mutation: QueuedMutation) -> Result<ExecutionOutcome> {
        let (Some(temp_id), Some(server_id)) = (
            mutation.temp_entity_id.clone(),
            mutation.server_entity_id().map(str::to_string),
        ) else {
            return Err(SyncError::Execution(format!(
                "mutation '{}' has nothing to reconcile",
                mutation.id
            )));
        };

        let outcome = match self
            .mapper
            .apply(mutation.command_type, &temp_id, &server_id)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                event!(
                    Level::ERROR,
                    mutation_id = %mutation.id,
                    error = %err,
                    "reconciliation deferred"
                );
                mutation.last_error = Some(format!("reconciliation deferred: {}", err));
                self.store.lock().await.put(mutation).await?;
                return Ok(ExecutionOutcome::ReconciliationDeferred);
            }
        };

        let miss = outcome.is_miss();
        let mut store = self.store.lock().await;
        if miss {
            event!(
                Level::WARN,
                mutation_id = %mutation.id,
                temp_entity_id = %temp_id,
                server_entity_id = %server_id,
                reason = %outcome.describe(),
                "reconciliation miss"
            );
            store
                .record_miss(ReconciliationMiss {
                    mutation_id: mutation.id.clone(),
                    command_type: mutation.command_type,
                    temp_entity_id: Some(temp_id),
                    server_entity_id: Some(server_id),
                    reason: outcome.describe(),
                    recorded_at: Utc::now(),
                })
                .await?;
        }

        mutation.mark_reconciled()?;
        store.put(mutation.clone()).await?;
        store.remove(&mutation.id, "reconciled").await?;
        Ok(ExecutionOutcome::Reconciled { miss })
    }

    async fn fail(
        &self,
        mut mutation: QueuedMutation,
        error: String,
        should_retry: bool,
    ) -> Result<ExecutionOutcome> {
        if !should_retry {
            self.quarantine
                .admit(mutation, format!("non-retryable failure: {}", error))
                .await?;
            return Ok(ExecutionOutcome::Quarantined);
        }

        if mutation.record_failed_attempt(error.clone())? {
            event!(
                Level::WARN,
                retry_count = mutation.retry_count,
                max_retries = mutation.max_retries,
                error = %error,
                "mutation failed; will retry"
            );
            self.store.lock().await.put(mutation).await?;
            return Ok(ExecutionOutcome::RetryScheduled);
        }

        let reason = format!(
            "retries exhausted after {} attempts: {}",
            mutation.retry_count, error
        );
        self.quarantine.admit(mutation, reason).await?;
        Ok(ExecutionOutcome::Quarantined)
    }

    async fn resolve_conflict(
        &self,
        mutation: QueuedMutation,
        server_data: String,
    ) -> Result<ExecutionOutcome> {
        let resolution = self.resolver.resolve(&mutation, &server_data).await;
        match &resolution {
            ConflictResolution::Quarantine { reason } => {
                self.quarantine.admit(mutation, reason.clone()).await?;
            }
            _ => {
                self.store
                    .lock()
                    .await
                    .remove(&mutation.id, "conflict resolved")
                    .await?;
            }
        }
        Ok(ExecutionOutcome::ConflictResolved(resolution))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
