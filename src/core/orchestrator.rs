//! Operation orchestrator
//!
//! [`RomToolsManager`] is the single writer of [`RomToolsState`]. It owns the
//! phase machine
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> OperationInFlight(op)
//!                        |
//!                        +-> Failed(reason)   (executor unreachable)
//! ```
//!
//! and admits at most one operation at a time. Every request runs on its own
//! tokio task, so dropping the caller's future never interrupts a flash or a
//! restore halfway; the phase returns to `Ready` only when the work ends.
//! State, progress and phase are published through `tokio::sync::watch`.

use futures::{FutureExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::backup::BackupManager;
use super::bootloader::{BootloaderGate, GatedOperation, SafetyCheckResult};
use super::capabilities::probe_capabilities;
use super::config::RomToolsConfig;
use super::flash::FlashManager;
use super::model::{
    now_millis, AvailableRom, BackupInfo, ErrorReport, OperationKind, OperationProgress,
    OperationStage, RomCapabilities, RomFile, RomToolsState,
};
use super::recovery::{recovery_partition, RecoveryManager, RECOVERY_PARTITION};
use super::retention::{RetentionManager, RetentionMechanism, RetentionStatus, RetentionVerdict};
use super::signals::{PreflightSignals, PropertyReader, SignalCollector};
use super::verify::VerificationManager;
use crate::error::{DownloadError, RecoveryError, RomToolsError};
use crate::infra::command::CommandExecutor;
use crate::infra::dirs::RomToolsDirs;
use crate::infra::download::DownloadManager;

/// Where the orchestrator is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    OperationInFlight(OperationKind),
    Failed(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Initializing => f.write_str("initializing"),
            Self::Ready => f.write_str("ready"),
            Self::OperationInFlight(kind) => write!(f, "{kind} in progress"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Behaviour switches taken from the user configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub package_id: Option<String>,
    pub backup_partitions: Vec<String>,
    pub auto_backup_before_flash: bool,
    pub verify_before_restore: bool,
    pub require_retention_before_flash: bool,
}

impl From<&RomToolsConfig> for OrchestratorSettings {
    fn from(config: &RomToolsConfig) -> Self {
        Self {
            package_id: config.package_id().map(str::to_string),
            backup_partitions: config.backup_partitions(),
            auto_backup_before_flash: config.auto_backup_before_flash(),
            verify_before_restore: config.verify_before_restore(),
            require_retention_before_flash: config.require_retention_before_flash(),
        }
    }
}

/// The managers the orchestrator sequences
#[derive(Debug, Clone)]
pub struct Managers {
    pub gate: BootloaderGate,
    pub retention: RetentionManager,
    pub backups: BackupManager,
    pub flash: FlashManager,
    pub recovery: RecoveryManager,
    pub verifier: VerificationManager,
}

impl Managers {
    /// Wire every manager to one executor, placing files per config and dirs
    pub fn from_config(
        executor: &Arc<dyn CommandExecutor>,
        config: &RomToolsConfig,
        dirs: &RomToolsDirs,
    ) -> Self {
        let signals = SignalCollector::new(PropertyReader::new(executor.clone()));
        Self {
            gate: BootloaderGate::new(signals).with_min_flash_battery(config.min_flash_battery()),
            retention: RetentionManager::new(executor.clone(), config.retention_dir(dirs)),
            backups: BackupManager::new(executor.clone(), config.backups_dir(dirs)),
            flash: FlashManager::new(
                executor.clone(),
                DownloadManager::with_config(config.max_retries(), config.base_delay_ms()),
                config.downloads_dir(dirs),
            ),
            recovery: RecoveryManager::new(executor.clone()),
            verifier: VerificationManager::new(executor.clone()),
        }
    }
}

struct Inner {
    executor: Arc<dyn CommandExecutor>,
    managers: Managers,
    settings: OrchestratorSettings,
    state_tx: watch::Sender<RomToolsState>,
    progress_tx: watch::Sender<Option<OperationProgress>>,
    phase_tx: watch::Sender<Phase>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn update_state(&self, modify: impl FnOnce(&mut RomToolsState)) {
        self.state_tx.send_modify(modify);
    }

    fn record_error(&self, operation: Option<OperationKind>, error: &RomToolsError) {
        let report = ErrorReport::from_error(operation, error);
        self.update_state(|state| state.last_error = Some(report));
    }

    fn finish<T>(&self, kind: OperationKind, result: &Result<T, RomToolsError>) {
        match result {
            Ok(_) => {
                tracing::info!("{} finished", kind);
                self.progress_tx.send_replace(Some(OperationProgress {
                    operation: kind,
                    stage: OperationStage::Completed,
                    progress: 100.0,
                    is_terminal: true,
                }));
            }
            Err(e) => {
                tracing::error!("{} failed: {}", kind, e);
                self.progress_tx.send_modify(|current| {
                    let reached = current
                        .as_ref()
                        .filter(|p| p.operation == kind)
                        .map_or(0.0, |p| p.progress);
                    *current = Some(OperationProgress {
                        operation: kind,
                        stage: OperationStage::Failed,
                        progress: reached,
                        is_terminal: true,
                    });
                });
                self.record_error(Some(kind), e);
            }
        }
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.phase_tx.send_replace(Phase::Ready);
    }
}

/// Publishes progress for one operation, clamped and never decreasing
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
    kind: OperationKind,
}

impl ProgressReporter {
    /// Publish a percentage for a stage
    pub fn report(&self, stage: OperationStage, percent: f32) {
        let value = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        let kind = self.kind;
        self.inner.progress_tx.send_modify(|current| {
            let floor = current
                .as_ref()
                .filter(|p| p.operation == kind && !p.is_terminal)
                .map_or(0.0, |p| p.progress);
            *current = Some(OperationProgress {
                operation: kind,
                stage,
                progress: value.max(floor),
                is_terminal: false,
            });
        });
    }

    /// Callback mapping a manager's 0..=100 onto `start..=end` of the operation
    pub fn scaled(&self, stage: OperationStage, start: f32, end: f32) -> impl FnMut(f32) + Send + 'static {
        let reporter = self.clone();
        reporter.report(stage, start);
        move |percent| reporter.report(stage, start + (end - start) * percent.clamp(0.0, 100.0) / 100.0)
    }
}

struct OpContext {
    inner: Arc<Inner>,
    progress: ProgressReporter,
    token: CancellationToken,
}

async fn blocking<T, F>(work: F) -> Result<T, RomToolsError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RomToolsError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RomToolsError::TaskFailed(e.to_string()))?
}

/// Single-flight coordinator over all managers
#[derive(Clone)]
pub struct RomToolsManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for RomToolsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RomToolsManager")
            .field("phase", &*self.inner.phase_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl RomToolsManager {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        managers: Managers,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                managers,
                settings,
                state_tx: watch::Sender::new(RomToolsState::default()),
                progress_tx: watch::Sender::new(None),
                phase_tx: watch::Sender::new(Phase::Uninitialized),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Build from a user configuration
    pub fn from_config(
        executor: Arc<dyn CommandExecutor>,
        config: &RomToolsConfig,
        dirs: &RomToolsDirs,
    ) -> Self {
        let managers = Managers::from_config(&executor, config, dirs);
        Self::new(executor, managers, OrchestratorSettings::from(config))
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RomToolsState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<OperationProgress>> {
        self.inner.progress_tx.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn state(&self) -> RomToolsState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn progress(&self) -> Option<OperationProgress> {
        self.inner.progress_tx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase_tx.borrow().clone()
    }

    pub fn managers(&self) -> &Managers {
        &self.inner.managers
    }

    /// Probe capabilities and load the backup list and retention status
    ///
    /// Allowed from `Uninitialized`, `Ready` and `Failed`. A re-probe replaces
    /// the capability snapshot wholesale.
    pub async fn initialize(&self) -> Result<RomCapabilities, RomToolsError> {
        let mut rejection = None;
        self.inner.phase_tx.send_if_modified(|phase| match phase {
            Phase::Uninitialized | Phase::Ready | Phase::Failed(_) => {
                *phase = Phase::Initializing;
                true
            }
            Phase::OperationInFlight(current) => {
                rejection = Some(RomToolsError::OperationInProgress { current: *current });
                false
            }
            Phase::Initializing => {
                rejection = Some(RomToolsError::NotReady {
                    phase: Phase::Initializing.to_string(),
                });
                false
            }
        });
        if let Some(e) = rejection {
            return Err(e);
        }
        tracing::info!("Initializing ROM tools");

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let probe = inner.clone();
            let result = blocking(move || {
                let m = &probe.managers;
                let capabilities = probe_capabilities(probe.executor.as_ref(), &m.gate)?;
                let backups = m.backups.list_backups().unwrap_or_else(|e| {
                    tracing::warn!("Could not list backups: {}", e);
                    Vec::new()
                });
                let retention = probe
                    .settings
                    .package_id
                    .as_deref()
                    .and_then(|id| m.retention.recall(id));
                Ok((capabilities, backups, retention))
            })
            .await;

            match result {
                Ok((capabilities, backups, retention)) => {
                    let snapshot = capabilities.clone();
                    inner.update_state(|state| {
                        state.is_initialized = true;
                        state.capabilities = Some(snapshot);
                        state.backups = backups;
                        state.retention = retention;
                    });
                    inner.phase_tx.send_replace(Phase::Ready);
                    Ok(capabilities)
                }
                Err(e) => {
                    tracing::error!("Initialization failed: {}", e);
                    inner.record_error(None, &e);
                    inner.phase_tx.send_replace(Phase::Failed(e.to_string()));
                    Err(e)
                }
            }
        });
        task.await
            .map_err(|e| RomToolsError::TaskFailed(e.to_string()))?
    }

    /// Current device signals; allowed at any time
    pub async fn collect_signals(&self) -> Result<PreflightSignals, RomToolsError> {
        let gate = self.inner.managers.gate.clone();
        blocking(move || Ok(gate.signals().collect_preflight_signals())).await
    }

    /// Assess the device for an operation; allowed at any time
    pub async fn preflight(&self, operation: GatedOperation) -> Result<SafetyCheckResult, RomToolsError> {
        let gate = self.inner.managers.gate.clone();
        blocking(move || Ok(gate.preflight(operation))).await
    }

    /// Always refused; see [`BootloaderGate::request_unlock`]
    pub async fn request_unlock(&self) -> Result<(), RomToolsError> {
        let gate = self.inner.managers.gate.clone();
        let result = blocking(move || gate.request_unlock().map_err(RomToolsError::from)).await;
        if let Err(e) = &result {
            self.inner.record_error(None, e);
        }
        result
    }

    /// Replace the catalog supplied by the external fetcher
    pub fn set_available_roms(&self, roms: Vec<AvailableRom>) {
        self.inner.update_state(|state| state.available_roms = roms);
    }

    /// Re-read the backup list from disk
    pub async fn refresh_backups(&self) -> Result<Vec<BackupInfo>, RomToolsError> {
        let backups = self.inner.managers.backups.clone();
        let listed = blocking(move || backups.list_backups().map_err(RomToolsError::from)).await?;
        let published = listed.clone();
        self.inner.update_state(|state| state.backups = published);
        Ok(listed)
    }

    /// Cancel the in-flight download
    ///
    /// Flash and restore write partitions and are never interrupted; every
    /// non-download operation answers `NotCancellable`.
    pub fn cancel(&self) -> Result<OperationKind, RomToolsError> {
        // Holding the slot orders this against `begin` storing the token
        let slot = self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        match self.phase() {
            Phase::OperationInFlight(kind) if kind.is_cancellable() => {
                if let Some(token) = slot.as_ref() {
                    tracing::info!("Cancelling {}", kind);
                    token.cancel();
                }
                Ok(kind)
            }
            Phase::OperationInFlight(kind) => Err(RomToolsError::NotCancellable { operation: kind }),
            _ => Err(RomToolsError::NothingToCancel),
        }
    }

    /// Claim the single operation slot
    fn begin(&self, kind: OperationKind) -> Result<CancellationToken, RomToolsError> {
        let token = CancellationToken::new();
        let mut rejection = None;
        {
            // The token is in place before any observer sees the new phase
            let mut slot = self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            self.inner.phase_tx.send_if_modified(|phase| match phase {
                Phase::Ready => {
                    *slot = Some(token.clone());
                    *phase = Phase::OperationInFlight(kind);
                    true
                }
                Phase::OperationInFlight(current) => {
                    rejection = Some(RomToolsError::OperationInProgress { current: *current });
                    false
                }
                other => {
                    rejection = Some(RomToolsError::NotReady {
                        phase: other.to_string(),
                    });
                    false
                }
            });
        }
        if let Some(e) = rejection {
            tracing::warn!("Rejected {}: {}", kind, e);
            return Err(e);
        }

        self.inner.update_state(|state| state.last_error = None);
        self.inner.progress_tx.send_replace(Some(OperationProgress {
            operation: kind,
            stage: OperationStage::Preparing,
            progress: 0.0,
            is_terminal: false,
        }));
        tracing::info!("{} started", kind);
        Ok(token)
    }

    /// Run one operation on its own task and fold the result back into state
    async fn run<T, F, Fut>(&self, kind: OperationKind, work: F) -> Result<T, RomToolsError>
    where
        T: Send + 'static,
        F: FnOnce(OpContext) -> Fut,
        Fut: Future<Output = Result<T, RomToolsError>> + Send + 'static,
    {
        let token = self.begin(kind)?;
        let inner = self.inner.clone();
        let fut = work(OpContext {
            inner: inner.clone(),
            progress: ProgressReporter {
                inner: inner.clone(),
                kind,
            },
            token,
        });

        let task = tokio::spawn(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(RomToolsError::TaskFailed(format!("{kind} panicked"))),
            };
            inner.finish(kind, &result);
            result
        });
        task.await
            .map_err(|e| RomToolsError::TaskFailed(e.to_string()))?
    }

    /// Back up partitions; defaults come from the configuration
    pub async fn request_backup(
        &self,
        name: Option<String>,
        partitions: Option<Vec<String>>,
    ) -> Result<BackupInfo, RomToolsError> {
        self.run(OperationKind::Backup, |ctx| async move {
            let partitions = partitions.unwrap_or_else(|| ctx.inner.settings.backup_partitions.clone());
            let name = name.unwrap_or_else(|| format!("backup-{}", now_millis()));
            ensure_ready(&ctx, GatedOperation::Backup).await?;
            backup_step(&ctx, name, partitions, 0.0, 100.0).await
        })
        .await
    }

    /// Restore a backup; the given value is never modified
    pub async fn request_restore(&self, info: BackupInfo) -> Result<(), RomToolsError> {
        self.run(OperationKind::Restore, |ctx| async move {
            ensure_ready(&ctx, GatedOperation::Restore).await?;

            if ctx.inner.settings.verify_before_restore {
                let m = ctx.inner.managers.clone();
                let target = info.clone();
                ctx.progress.report(OperationStage::Verifying, 0.0);
                blocking(move || {
                    let manifest = m.backups.manifest_for(&target)?;
                    m.verifier.verify_backup(&manifest)?;
                    Ok(())
                })
                .await?;
            }

            let backups = ctx.inner.managers.backups.clone();
            let on_progress = ctx.progress.scaled(OperationStage::Restoring, 20.0, 100.0);
            blocking(move || {
                backups
                    .restore_backup(&info, on_progress)
                    .map_err(RomToolsError::from)
            })
            .await
        })
        .await
    }

    /// Verify a ROM artifact against its checksum
    pub async fn request_verify(&self, file: RomFile) -> Result<(), RomToolsError> {
        self.run(OperationKind::Verify, |ctx| async move { verify_step(&ctx, file, 0.0, 100.0).await })
            .await
    }

    /// Verify every image checksum of a named backup
    pub async fn request_verify_backup(&self, name: String) -> Result<(), RomToolsError> {
        self.run(OperationKind::Verify, |ctx| async move {
            let m = ctx.inner.managers.clone();
            ctx.progress.report(OperationStage::Verifying, 0.0);
            blocking(move || {
                let manifest = m.backups.load_manifest(&name)?;
                m.verifier.verify_backup(&manifest)?;
                Ok(())
            })
            .await
        })
        .await
    }

    /// Remove a named backup and republish the list
    pub async fn request_delete_backup(&self, name: String) -> Result<(), RomToolsError> {
        self.run(OperationKind::Backup, |ctx| async move {
            let backups = ctx.inner.managers.backups.clone();
            let remaining = blocking(move || {
                backups.delete_backup(&name)?;
                Ok(backups.list_backups()?)
            })
            .await?;
            ctx.inner.update_state(|state| state.backups = remaining);
            Ok(())
        })
        .await
    }

    /// Provision every retention mechanism
    ///
    /// Returns `RetentionCompromised` when fewer than two mechanisms are
    /// active; the status is still published in the state.
    pub async fn request_retention_provision(
        &self,
        package_id: Option<String>,
    ) -> Result<RetentionStatus, RomToolsError> {
        self.run(OperationKind::Retention, |ctx| async move {
            let package_id = package_id
                .or_else(|| ctx.inner.settings.package_id.clone())
                .ok_or(RomToolsError::MissingPackageId)?;
            let status = retention_step(&ctx, &package_id, 0.0, 100.0).await?;
            compromised(&status).map_or(Ok(status), Err)
        })
        .await
    }

    /// Re-read the retention status from disk
    pub async fn retention_status(&self) -> Result<Option<RetentionStatus>, RomToolsError> {
        let package_id = self
            .inner
            .settings
            .package_id
            .clone()
            .ok_or(RomToolsError::MissingPackageId)?;
        let retention = self.inner.managers.retention.clone();
        let status = blocking(move || Ok(retention.recall(&package_id))).await?;
        let published = status.clone();
        self.inner.update_state(|state| state.retention = published);
        Ok(status)
    }

    /// Remove all retained artifacts; only ever user-initiated
    pub async fn request_retention_wipe(&self) -> Result<(), RomToolsError> {
        self.run(OperationKind::Retention, |ctx| async move {
            let retention = ctx.inner.managers.retention.clone();
            let wiped = blocking(move || retention.wipe().map_err(RomToolsError::from)).await;
            // The local artifacts are gone even when a device-side hook survived
            ctx.inner.update_state(|state| state.retention = None);
            wiped
        })
        .await
    }

    /// Reinstall the retained package
    pub async fn request_retention_restore(&self) -> Result<(), RomToolsError> {
        self.run(OperationKind::Retention, |ctx| async move {
            let package_id = ctx
                .inner
                .settings
                .package_id
                .clone()
                .ok_or(RomToolsError::MissingPackageId)?;
            let retention = ctx.inner.managers.retention.clone();
            ctx.progress.report(OperationStage::RestoringRetained, 0.0);
            blocking(move || {
                retention
                    .restore_after_flash(&package_id)
                    .map_err(RomToolsError::from)
            })
            .await
        })
        .await
    }

    /// Download a catalog entry; cancellable with [`Self::cancel`]
    ///
    /// On success the artifact is appended to `downloaded_roms`. A cancelled
    /// or failed download leaves the state lists untouched.
    pub async fn request_download(&self, rom: AvailableRom) -> Result<RomFile, RomToolsError> {
        self.run(OperationKind::Download, |ctx| async move {
            let flash = ctx.inner.managers.flash.clone();
            let mut stream = flash.download_rom(&rom);
            ctx.progress.report(OperationStage::Downloading, 0.0);

            let completed = loop {
                tokio::select! {
                    biased;
                    () = ctx.token.cancelled() => {
                        return Err(RomToolsError::Cancelled { operation: OperationKind::Download });
                    }
                    item = stream.next() => match item {
                        Some(Ok(progress)) if progress.is_completed => break progress,
                        Some(Ok(progress)) => {
                            ctx.progress.report(OperationStage::Downloading, progress.progress);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(DownloadError::Incomplete { rom: rom.name.clone() }.into());
                        }
                    }
                }
            };

            let file = RomFile {
                name: rom.name.clone(),
                path: flash.download_path(&rom),
                size_bytes: completed.bytes_downloaded,
                checksum: rom.checksum.clone(),
            };
            let published = file.clone();
            ctx.inner.update_state(|state| {
                state.downloaded_roms.retain(|f| f.path != published.path);
                state.downloaded_roms.push(published);
            });
            Ok(file)
        })
        .await
    }

    /// Write a verified custom recovery image
    ///
    /// Gated like a flash and never cancellable. With
    /// `auto_backup_before_flash` the current recovery partition is backed
    /// up first so a bad image can be rolled back with a restore.
    pub async fn request_install_recovery(&self, image: RomFile) -> Result<(), RomToolsError> {
        self.run(OperationKind::InstallRecovery, |ctx| async move {
            ensure_ready(&ctx, GatedOperation::Recovery).await?;
            verify_step(&ctx, image.clone(), 0.0, 10.0).await?;

            let recovery = ctx.inner.managers.recovery.clone();
            if !blocking(move || Ok(recovery.has_recovery_partition()?)).await? {
                return Err(RecoveryError::NoRecoveryPartition {
                    path: recovery_partition(),
                }
                .into());
            }

            if ctx.inner.settings.auto_backup_before_flash {
                let name = format!("pre-recovery-{}", now_millis());
                let partitions = vec![RECOVERY_PARTITION.to_string()];
                backup_step(&ctx, name, partitions, 10.0, 30.0).await?;
            }

            let recovery = ctx.inner.managers.recovery.clone();
            let on_progress = ctx.progress.scaled(OperationStage::InstallingRecovery, 30.0, 100.0);
            blocking(move || {
                recovery
                    .install_recovery(&image, on_progress)
                    .map_err(RomToolsError::from)
            })
            .await
        })
        .await
    }

    /// Gate, verify, retain, back up, flash, check and restore
    ///
    /// A file that fails verification never reaches the flash step. Once the
    /// flash step starts the operation cannot be cancelled.
    pub async fn request_flash(&self, file: RomFile) -> Result<(), RomToolsError> {
        self.run(OperationKind::Flash, |ctx| async move {
            let settings = ctx.inner.settings.clone();

            ensure_ready(&ctx, GatedOperation::Flash).await?;
            verify_step(&ctx, file.clone(), 0.0, 10.0).await?;

            let retained = match settings.package_id.as_deref() {
                Some(package_id) => {
                    let status = retention_step(&ctx, package_id, 10.0, 20.0).await?;
                    if let Some(err) = compromised(&status) {
                        if settings.require_retention_before_flash {
                            return Err(err);
                        }
                        tracing::warn!("{}; flashing anyway", err);
                    }
                    status.mechanisms.get(&RetentionMechanism::PackageBackup) == Some(&true)
                }
                None => {
                    tracing::warn!("No package configured for retention; nothing will be carried over");
                    false
                }
            };

            if settings.auto_backup_before_flash {
                let name = format!("pre-flash-{}", now_millis());
                backup_step(&ctx, name, settings.backup_partitions.clone(), 20.0, 40.0).await?;
            }

            let m = ctx.inner.managers.clone();
            let staged = file.clone();
            let on_progress = ctx.progress.scaled(OperationStage::Flashing, 40.0, 85.0);
            blocking(move || m.flash.flash_rom(&staged, on_progress).map_err(RomToolsError::from))
                .await?;

            let m = ctx.inner.managers.clone();
            ctx.progress.report(OperationStage::VerifyingInstallation, 85.0);
            blocking(move || {
                m.verifier
                    .verify_installation(&file)
                    .map_err(|e| m.flash.abandon_staging(e.into()).into())
            })
            .await?;

            if let (true, Some(package_id)) = (retained, settings.package_id) {
                let retention = ctx.inner.managers.retention.clone();
                ctx.progress.report(OperationStage::RestoringRetained, 90.0);
                let restored = blocking(move || {
                    retention
                        .restore_after_flash(&package_id)
                        .map_err(RomToolsError::from)
                })
                .await;
                if let Err(e) = restored {
                    // The flash itself succeeded; keep the failure visible without failing it
                    tracing::warn!("Restoring retained package failed: {}", e);
                    ctx.inner.record_error(Some(OperationKind::Flash), &e);
                }
            }
            Ok(())
        })
        .await
    }
}

async fn ensure_ready(ctx: &OpContext, operation: GatedOperation) -> Result<PreflightSignals, RomToolsError> {
    let gate = ctx.inner.managers.gate.clone();
    blocking(move || gate.ensure_ready(operation).map_err(RomToolsError::from)).await
}

async fn verify_step(ctx: &OpContext, file: RomFile, start: f32, end: f32) -> Result<(), RomToolsError> {
    let verifier = ctx.inner.managers.verifier.clone();
    ctx.progress.report(OperationStage::Verifying, start);
    blocking(move || verifier.verify(&file).map_err(RomToolsError::from)).await?;
    ctx.progress.report(OperationStage::Verifying, end);
    Ok(())
}

async fn retention_step(
    ctx: &OpContext,
    package_id: &str,
    start: f32,
    end: f32,
) -> Result<RetentionStatus, RomToolsError> {
    let retention = ctx.inner.managers.retention.clone();
    let package_id = package_id.to_string();
    ctx.progress.report(OperationStage::SettingUpRetention, start);
    let status = blocking(move || {
        retention
            .provision_retention(&package_id)
            .map_err(RomToolsError::from)
    })
    .await?;
    let published = status.clone();
    ctx.inner.update_state(|state| state.retention = Some(published));
    ctx.progress.report(OperationStage::SettingUpRetention, end);
    Ok(status)
}

async fn backup_step(
    ctx: &OpContext,
    name: String,
    partitions: Vec<String>,
    start: f32,
    end: f32,
) -> Result<BackupInfo, RomToolsError> {
    let backups = ctx.inner.managers.backups.clone();
    let on_progress = ctx.progress.scaled(OperationStage::BackingUp, start, end);
    let info = blocking(move || {
        backups
            .create_backup(&name, &partitions, on_progress)
            .map_err(RomToolsError::from)
    })
    .await?;
    let published = info.clone();
    ctx.inner.update_state(|state| {
        state.backups.push(published);
        state.backups.sort_by_key(|b| b.created_at);
    });
    Ok(info)
}

fn compromised(status: &RetentionStatus) -> Option<RomToolsError> {
    match status.verdict() {
        RetentionVerdict::Compromised { succeeded } => Some(RomToolsError::RetentionCompromised {
            succeeded,
            total: RetentionMechanism::ALL.len(),
        }),
        RetentionVerdict::Partial { failed } => {
            tracing::info!("Partial retention: {:?} inactive, threshold met", failed);
            None
        }
        RetentionVerdict::Complete => None,
    }
}
