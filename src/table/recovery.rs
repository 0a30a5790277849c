//! Checkpoint, rehash, startup recovery and full repair
//!
//! Every operation here runs with the commit gate held exclusively and the
//! log pair locked, in that order.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::{Result, ShardKvError};
use crate::record::DataRecord;
use crate::storage::{Integrity, Layout, RehashPlan, ShardMap};
use crate::wal::{LogEntry, Method, RecoveryResult, WalRecovery, WriteAheadLog};

use super::{RepairReport, Table};

impl Table {
    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Flush every shard and append a checkpoint marker
    ///
    /// Returns true if a marker was written. No marker is written while any
    /// shard still holds pending writes.
    pub async fn flush(&self) -> Result<bool> {
        self.ensure_unlocked()?;
        let _gate = self.inner.gate.write().await;
        let mut wal = self.inner.wal.lock().await;
        self.checkpoint_locked(&mut wal, false).await
    }

    /// Stop the timer and checkpoint one last time
    pub async fn close(&self) -> Result<()> {
        self.stop_flusher().await;
        if !self.is_locked() {
            self.flush().await?;
        }
        info!(table = %self.inner.name, "Table closed");
        Ok(())
    }

    async fn checkpoint_locked(&self, wal: &mut WriteAheadLog, force: bool) -> Result<bool> {
        let flushed = self.inner.map.flush_all().await?;

        let pending = self.inner.map.pending_len();
        if pending > 0 {
            warn!(table = %self.inner.name, pending, "Skipping checkpoint with unflushed writes");
            return Ok(false);
        }
        if !force && flushed == 0 && wal.since_checkpoint() == 0 {
            return Ok(false);
        }

        let truncated = wal.checkpoint().await?;
        debug!(table = %self.inner.name, shards = flushed, truncated, "Checkpoint written");
        Ok(true)
    }

    // =========================================================================
    // Rehash
    // =========================================================================

    /// Redistribute every record over a new shard generation
    pub async fn rehash(&self) -> Result<()> {
        self.ensure_unlocked()?;
        let _gate = self.inner.gate.write().await;
        let mut wal = self.inner.wal.lock().await;
        let grow = self.inner.map.needs_rehash();
        self.rehash_locked(&mut wal, grow).await
    }

    pub(super) async fn rehash_if_needed(&self) -> Result<()> {
        let _gate = self.inner.gate.write().await;
        // Another writer may have rehashed while we waited
        if !self.inner.map.needs_rehash() {
            return Ok(());
        }
        let mut wal = self.inner.wal.lock().await;
        self.rehash_locked(&mut wal, true).await
    }

    async fn rehash_locked(&self, wal: &mut WriteAheadLog, grow: bool) -> Result<()> {
        let started = Instant::now();
        let from = self.inner.map.shard_count();
        let plan = self.inner.map.plan_rehash(grow).await?;
        let layout = plan.layout;

        info!(
            table = %self.inner.name,
            from,
            to = layout.shard_count,
            records = plan.records.len(),
            "Rehash started"
        );

        self.install(wal, plan).await?;
        self.checkpoint_locked(wal, true).await?;

        info!(
            table = %self.inner.name,
            generation = layout.generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rehash finished"
        );
        Ok(())
    }

    /// Log, write and swap in a new generation, then retire the old one
    ///
    /// New files, the manifest and the rebuilt reference index are all
    /// durable before any old file is deleted.
    async fn install(&self, wal: &mut WriteAheadLog, plan: RehashPlan) -> Result<usize> {
        let layout = plan.layout;
        for name in self.shard_names(&layout) {
            wal.record(&LogEntry::new_file(name, layout.generation, layout.shard_count))
                .await?;
        }

        let references = self.references_for(&layout, &plan.records);
        let records = plan.records.len();

        let old = self.inner.map.apply(plan).await?;
        self.inner.references.restart(references).await?;
        self.inner.map.retire(old).await;
        Ok(records)
    }

    fn shard_names(&self, layout: &Layout) -> Vec<String> {
        layout.shard_names(&self.inner.name, &self.inner.config.extension)
    }

    fn references_for(
        &self,
        layout: &Layout,
        records: &BTreeMap<String, DataRecord>,
    ) -> Vec<(String, String)> {
        records
            .keys()
            .map(|key| {
                let index = ShardMap::index_for(key, layout.shard_count);
                let shard = layout.shard_name(&self.inner.name, index, &self.inner.config.extension);
                (key.clone(), shard)
            })
            .collect()
    }

    // =========================================================================
    // Startup Recovery
    // =========================================================================

    /// Integrity-check the shards and replay the logs since the last checkpoint
    ///
    /// Runs on open; may be called again to re-validate the files on disk.
    /// A dirty shard, an unreadable manifest or mismatched logs lock the
    /// table instead of failing.
    pub async fn initialize(&self) -> Result<RecoveryResult> {
        let inner = &self.inner;
        let _gate = inner.gate.write().await;
        let mut wal = inner.wal.lock().await;
        inner.locked.store(false, std::sync::atomic::Ordering::SeqCst);

        let recovered = match WalRecovery::recover(&inner.paths, &inner.hash_key).await {
            Ok(recovered) => Some(recovered),
            Err(ShardKvError::WalCorruption(reason)) => {
                self.lock_table(&reason);
                None
            }
            Err(e) => return Err(e),
        };
        // Recovery may have truncated either file underneath the writers
        *wal = WriteAheadLog::open(&inner.paths, &inner.config).await?;

        let dir = inner.map.dir().to_path_buf();
        let (layout, fresh) = match Layout::load(&dir).await {
            Ok(Some(layout)) => (layout, false),
            Ok(None) => (Layout::initial(inner.config.min_shards), true),
            Err(ShardKvError::Integrity { reason, .. }) => {
                self.lock_table(&format!("unreadable layout manifest: {reason}"));
                return Ok(RecoveryResult::default());
            }
            Err(e) => return Err(e),
        };

        let reports = inner.map.load(layout, fresh).await?;
        if fresh {
            for name in self.shard_names(&layout) {
                wal.record(&LogEntry::new_file(name, layout.generation, layout.shard_count))
                    .await?;
            }
            layout
                .store(&dir, inner.config.rename_attempts, inner.config.rename_retry_delay())
                .await?;
        }

        for report in &reports {
            match &report.status {
                Integrity::Dirty { reason } => {
                    self.lock_table(&format!("shard {} is unreadable: {reason}", report.shard));
                }
                Integrity::Healed { kept, dropped } => {
                    info!(shard = %report.shard, kept, dropped, "Shard healed during startup");
                }
                Integrity::Clean { .. } => {}
            }
        }

        let Some((entries, result)) = recovered else {
            return Ok(RecoveryResult::default());
        };
        if self.is_locked() {
            return Ok(result);
        }

        for entry in &entries {
            self.replay(entry).await?;
        }
        self.checkpoint_locked(&mut wal, true).await?;

        if inner.config.rehash_on_boot || inner.map.needs_rehash() {
            let grow = inner.map.needs_rehash();
            self.rehash_locked(&mut wal, grow).await?;
        }

        info!(
            table = %inner.name,
            recovered = result.entries_recovered,
            discarded = result.entries_discarded,
            corrupted = result.entries_corrupted,
            truncated = result.was_truncated,
            "Recovery complete"
        );
        Ok(result)
    }

    /// Re-apply one committed entry to the shards and references
    async fn replay(&self, entry: &LogEntry) -> Result<()> {
        let inner = &self.inner;
        match entry.method {
            Method::Set => {
                let record = entry.to_record()?;
                let shard = inner.map.route(&record.key)?;
                inner.references.set_reference(&record.key, shard.name()).await?;
                inner.map.add(record)?;
            }
            Method::Delete => {
                inner.map.remove(&entry.key)?;
                inner.references.delete_reference(&entry.key).await?;
            }
            Method::DeleteMany => {
                let keys = entry.keys()?;
                inner.map.remove_many(&keys)?;
                inner.references.delete_references(&keys).await?;
            }
            Method::Clear => {
                inner.map.clear().await?;
                inner.references.clear().await?;
            }
            // The manifest is authoritative for the layout
            Method::NewFile | Method::Flush => {}
        }
        Ok(())
    }

    // =========================================================================
    // Full Repair
    // =========================================================================

    /// Rebuild every shard and reference from the full-writer log
    ///
    /// The only operation a locked table accepts. On success the table is
    /// unlocked and the transaction log restarts under a new IV; on failure
    /// the table stays locked.
    pub async fn full_repair(&self) -> Result<RepairReport> {
        let _gate = self.inner.gate.write().await;
        let mut wal = self.inner.wal.lock().await;
        let started = Instant::now();
        info!(table = %self.inner.name, "Full repair started");

        match self.repair_locked(&mut wal).await {
            Ok(report) => {
                self.inner.locked.store(false, std::sync::atomic::Ordering::SeqCst);
                info!(
                    table = %self.inner.name,
                    records = report.records,
                    shards = report.shards,
                    applied = report.entries_applied,
                    corrupted = report.entries_corrupted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Full repair finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(table = %self.inner.name, error = %e, "Full repair failed");
                self.inner.locked.store(true, std::sync::atomic::Ordering::SeqCst);
                Err(ShardKvError::Repair(e.to_string()))
            }
        }
    }

    async fn repair_locked(&self, wal: &mut WriteAheadLog) -> Result<RepairReport> {
        let inner = &self.inner;

        // Cut uncommitted tails where the logs still line up
        if let Err(e) = WalRecovery::recover(&inner.paths, &inner.hash_key).await {
            warn!(table = %inner.name, error = %e, "Logs do not line up; replaying the full log as is");
        }
        *wal = WriteAheadLog::open(&inner.paths, &inner.config).await?;

        let scan = WalRecovery::scan_full(&inner.paths.full).await?;
        let mut report = RepairReport {
            entries_corrupted: scan.corrupted,
            ..RepairReport::default()
        };

        let mut records: BTreeMap<String, DataRecord> = BTreeMap::new();
        let mut shard_count = inner.config.min_shards;

        for (offset, entry) in &scan.entries {
            let applied = match entry.method {
                Method::Set => entry.to_record().map(|record| {
                    records.insert(record.key.clone(), record);
                }),
                Method::Delete => {
                    records.remove(&entry.key);
                    Ok(())
                }
                Method::DeleteMany => entry.keys().map(|keys| {
                    for key in keys {
                        records.remove(&key);
                    }
                }),
                Method::Clear => {
                    records.clear();
                    Ok(())
                }
                Method::NewFile => {
                    if let Some((_, count)) = entry.layout() {
                        shard_count = count;
                    }
                    Ok(())
                }
                Method::Flush => continue,
            };

            match applied {
                Ok(()) => report.entries_applied += 1,
                Err(e) => {
                    warn!(offset, error = %e, "Skipping unreadable full-log entry");
                    report.entries_corrupted += 1;
                }
            }
        }
        records.retain(|_, record| !record.is_expired());

        let count = inner.map.target_count(records.len(), shard_count, false);
        let layout = inner.map.layout().next(count);
        report.records = records.len();
        report.shards = layout.shard_count;

        self.install(wal, RehashPlan { layout, records }).await?;
        inner.map.remove_stale(layout.generation).await?;
        wal.reset().await?;
        Ok(report)
    }
}
