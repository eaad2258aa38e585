impl QueueStore {
    fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(QUEUE_SNAPSHOT_FILE)
    }

    fn journal_path(&self) -> PathBuf {
        self.root_dir.join(QUEUE_JOURNAL_FILE)
    }

    /// Rebuilds memory from the snapshot and the journal tail after it.
    async fn load_from_disk(&mut self) -> Result<()> {
        let mut last_seq = 0u64;

        if let Some(snapshot) = self.read_snapshot_file().await? {
            if snapshot.format_version != QUEUE_FORMAT_VERSION {
                return Err(SyncError::Storage(format!(
                    "Unsupported queue snapshot format version {}",
                    snapshot.format_version
                )));
            }
            for mutation in snapshot.mutations {
                self.apply_upsert(mutation);
            }
            for miss in snapshot.reconciliation_misses {
                self.apply_miss(miss);
            }
            last_seq = snapshot.last_seq;
        }

        let records = self.read_journal_records(last_seq).await?;
        let mut max_seq = last_seq;
        for record in records {
            max_seq = max_seq.max(record.seq);
            self.apply_journal_record_to_memory(record);
        }

        self.seq_next = max_seq.saturating_add(1).max(1);
        Ok(())
    }

    fn apply_journal_record_to_memory(&mut self, record: QueueJournalRecord) {
        match record.op {
            QueueJournalOp::Upsert { mutation } => self.apply_upsert(mutation),
            QueueJournalOp::Delete { id, .. } => self.apply_delete(&id),
            QueueJournalOp::Replace {
                removed_id,
                mutation,
            } => {
                self.apply_delete(&removed_id);
                self.apply_upsert(mutation);
            }
            QueueJournalOp::MissRecorded { miss } => self.apply_miss(miss),
        }
    }

    async fn read_journal_records(&self, greater_than_seq: u64) -> Result<Vec<QueueJournalRecord>> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut records = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let record = match serde_json::from_str::<QueueJournalRecord>(&line) {
                Ok(record) => record,
                Err(err) => {
                    // A torn final line is what a crash mid-append leaves behind.
                    event!(Level::WARN, error = %err, "skipping unreadable journal line");
                    continue;
                }
            };

            if record.seq > greater_than_seq {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.seq.cmp(&b.seq));
        Ok(records)
    }

    /// Appends one record, syncing according to the durability mode.
    async fn append_record(&mut self, op: QueueJournalOp) -> Result<()> {
        let seq = self.seq_next;
        let record = QueueJournalRecord {
            seq,
            ts_unix_ms: Utc::now().timestamp_millis(),
            op,
        };

        let mut line = serde_json::to_string(&record)
            .map_err(|err| SyncError::Serialization(format!("serialize queue journal: {}", err)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let now_ms = Utc::now().timestamp_millis();
        match self.policy.durability {
            DurabilityMode::Strict => {
                file.sync_data().await?;
                self.last_sync_unix_ms = now_ms;
            }
            DurabilityMode::Eventual { sync_interval_ms } => {
                if now_ms - self.last_sync_unix_ms >= sync_interval_ms as i64 {
                    file.sync_data().await?;
                    self.last_sync_unix_ms = now_ms;
                }
            }
        }

        self.seq_next = seq.saturating_add(1);
        self.ops_since_snapshot = self.ops_since_snapshot.saturating_add(1);
        Ok(())
    }

    async fn maybe_snapshot_and_compact(&mut self) -> Result<()> {
        if self.ops_since_snapshot < self.policy.snapshot.snapshot_every_ops {
            return Ok(());
        }
        self.snapshot_now().await
    }

    /// Writes a snapshot and drops the journal records it covers.
    pub async fn snapshot_now(&mut self) -> Result<()> {
        let snapshot = self.export_snapshot();
        self.write_snapshot_file(&snapshot).await?;
        self.compact_journal(snapshot.last_seq).await?;
        self.ops_since_snapshot = 0;
        event!(Level::DEBUG, last_seq = snapshot.last_seq, "queue snapshot written");
        Ok(())
    }

    fn export_snapshot(&self) -> QueueSnapshotFile {
        QueueSnapshotFile {
            format_version: QUEUE_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            last_seq: self.seq_next.saturating_sub(1),
            mutations: self.ordered().into_iter().cloned().collect(),
            reconciliation_misses: self.misses.iter().cloned().collect(),
        }
    }

    async fn read_snapshot_file(&self) -> Result<Option<QueueSnapshotFile>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path).await?;
        let snapshot = serde_json::from_slice::<QueueSnapshotFile>(&bytes)
            .map_err(|err| SyncError::Storage(format!("parse queue snapshot: {}", err)))?;
        Ok(Some(snapshot))
    }

    /// Writes to a temporary file and renames it over the target.
    async fn write_snapshot_file(&self, snapshot: &QueueSnapshotFile) -> Result<()> {
        let path = self.snapshot_path();
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| SyncError::Serialization(format!("serialize queue snapshot: {}", err)))?;

        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&json).await?;
        tmp.sync_all().await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn compact_journal(&self, keep_after_seq: u64) -> Result<()> {
        let journal_path = self.journal_path();
        let retained = self
            .read_journal_records(keep_after_seq)
            .await?
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let tmp_path = journal_path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;

        for line in retained {
            tmp.write_all(line.as_bytes()).await?;
            tmp.write_all(b"\n").await?;
        }
        tmp.flush().await?;
        tmp.sync_all().await?;

        fs::rename(&tmp_path, &journal_path).await?;
        Ok(())
    }
}
