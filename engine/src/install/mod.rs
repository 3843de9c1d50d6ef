//! Install jobs.
//!
//! A job owns one archive and runs in two phases on the shared worker pool.
//! Phase 1 enumerates components and probes each against the existing
//! installation; if any component needs a user decision the job suspends in
//! `AwaitingUserInput`, otherwise phase 2 follows immediately. Phase 2
//! honours the per-component decisions, skips components that need no
//! action, runs the install transaction for the rest, and tells the library
//! server to rescan freshly written folders.
//!
//! Ownership: the worker thread has exclusive access to job internals while
//! the state is `Installing`; the submitter gets read-only access (plus the
//! decision setters) while `AwaitingUserInput`. State transitions are
//! release-stores matched by acquire-loads, so an observer of
//! `AwaitingUserInput` sees every component verdict written before it.

pub mod components;
pub mod probe;
pub mod transaction;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::archive::ArchiveReader;
use crate::core::seams::RngHandle;
use crate::error::{EngineError, EngineResult, Severity};
use crate::libraries::{PresetServer, SampleLibraryServer};
use crate::logger;
use crate::reporting;

use components::{identify_components, Component};
use probe::{probe_component, InstallVerdict, RequiredAction};

/// Upper bound on concurrently tracked jobs; submission fails beyond it.
pub const MAX_ACTIVE_JOBS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Installing = 0,
    AwaitingUserInput = 1,
    DoneSuccess = 2,
    DoneError = 3,
}

impl JobState {
    fn from_u8(value: u8) -> JobState {
        match value {
            0 => JobState::Installing,
            1 => JobState::AwaitingUserInput,
            2 => JobState::DoneSuccess,
            _ => JobState::DoneError,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::DoneSuccess | JobState::DoneError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserDecision {
    Unknown = 0,
    Overwrite = 1,
    Skip = 2,
}

impl UserDecision {
    fn from_u8(value: u8) -> UserDecision {
        match value {
            1 => UserDecision::Overwrite,
            2 => UserDecision::Skip,
            _ => UserDecision::Unknown,
        }
    }
}

/// One component plus its probe verdict and the user's decision about it.
pub struct PlannedComponent {
    pub component: Component,
    pub verdict: InstallVerdict,
    decision: AtomicU8,
}

impl PlannedComponent {
    fn new(component: Component, verdict: InstallVerdict) -> Self {
        Self {
            component,
            verdict,
            decision: AtomicU8::new(UserDecision::Unknown as u8),
        }
    }

    pub fn decision(&self) -> UserDecision {
        UserDecision::from_u8(self.decision.load(Ordering::Relaxed))
    }

    pub fn needs_user_input(&self) -> bool {
        self.verdict.required_action() == RequiredAction::UserInputRequired
            && self.decision() == UserDecision::Unknown
    }
}

/// Shared services every install job needs.
pub struct InstallContext {
    pub library_server: Arc<SampleLibraryServer>,
    pub preset_server: Arc<PresetServer>,
    pub rng: Arc<RngHandle>,
    /// Written into generated checksum manifests.
    pub generator_tag: String,
    pub libraries_dir: PathBuf,
    pub presets_dir: PathBuf,
}

pub struct InstallJob {
    archive_path: PathBuf,
    state: AtomicU8,
    abort: AtomicBool,
    error_buffer: Mutex<Vec<String>>,
    plans: Mutex<Vec<Arc<PlannedComponent>>>,
    /// The open archive, carried from phase 1 into phase 2.
    reader: Mutex<Option<ArchiveReader<BufReader<File>>>>,
}

impl InstallJob {
    fn new(archive_path: PathBuf) -> Self {
        Self {
            archive_path,
            state: AtomicU8::new(JobState::Installing as u8),
            abort: AtomicBool::new(false),
            error_buffer: Mutex::new(Vec::new()),
            plans: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
        }
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ask the worker to stop before the next component.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Snapshot of the planned components. Meaningful once the state has
    /// been observed as `AwaitingUserInput` or terminal.
    pub fn planned_components(&self) -> Vec<Arc<PlannedComponent>> {
        self.plans.lock().unwrap().clone()
    }

    /// Record the user's decision for one component while the job is
    /// suspended in `AwaitingUserInput`.
    pub fn set_user_decision(&self, index: usize, decision: UserDecision) -> EngineResult<()> {
        if self.state() != JobState::AwaitingUserInput {
            return Err(EngineError::Api(
                "job is not awaiting user input".to_string(),
            ));
        }
        let plans = self.plans.lock().unwrap();
        let plan = plans
            .get(index)
            .ok_or_else(|| EngineError::Api(format!("no component at index {}", index)))?;
        plan.decision.store(decision as u8, Ordering::Relaxed);
        Ok(())
    }

    /// Accumulated error text, one line per failure.
    pub fn error_text(&self) -> String {
        self.error_buffer.lock().unwrap().join("\n")
    }

    fn push_error(&self, message: String) {
        self.error_buffer.lock().unwrap().push(message);
    }

    fn check_abort(&self) -> EngineResult<()> {
        if self.abort_requested() {
            Err(EngineError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Bounded pool of install jobs running on the shared thread pool.
pub struct InstallJobPool {
    thread_pool: Arc<rayon::ThreadPool>,
    context: Arc<InstallContext>,
    jobs: Mutex<Vec<Arc<InstallJob>>>,
}

impl InstallJobPool {
    pub fn new(thread_pool: Arc<rayon::ThreadPool>, context: Arc<InstallContext>) -> Self {
        Self {
            thread_pool,
            context,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Submit an archive for installation. The returned job is shared with
    /// the worker; poll its state or park it until `AwaitingUserInput`.
    pub fn submit(&self, archive_path: PathBuf) -> EngineResult<Arc<InstallJob>> {
        let job = {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.len() >= MAX_ACTIVE_JOBS {
                return Err(EngineError::Api(format!(
                    "too many active install jobs (max {})",
                    MAX_ACTIVE_JOBS
                )));
            }
            let job = Arc::new(InstallJob::new(archive_path));
            jobs.push(job.clone());
            job
        };

        let context = self.context.clone();
        let worker_job = job.clone();
        self.thread_pool
            .spawn(move || run_phase_one(worker_job, context));
        Ok(job)
    }

    /// Resume a job suspended in `AwaitingUserInput` once decisions are in.
    /// Components still lacking a decision are treated as `Skip`.
    pub fn resume(&self, job: &Arc<InstallJob>) -> EngineResult<()> {
        job.state
            .compare_exchange(
                JobState::AwaitingUserInput as u8,
                JobState::Installing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| EngineError::Api("job is not awaiting user input".to_string()))?;

        let context = self.context.clone();
        let worker_job = job.clone();
        self.thread_pool
            .spawn(move || run_phase_two(worker_job, context));
        Ok(())
    }

    /// Drop jobs whose terminal state the submitter has observed.
    pub fn reap_completed(&self) {
        self.jobs
            .lock()
            .unwrap()
            .retain(|job| !job.state().is_terminal());
    }

    pub fn active_jobs(&self) -> Vec<Arc<InstallJob>> {
        self.jobs.lock().unwrap().clone()
    }
}

fn run_phase_one(job: Arc<InstallJob>, context: Arc<InstallContext>) {
    match phase_one(&job, &context) {
        Ok(needs_input) => {
            if needs_input {
                // Verdicts are published before this release-store.
                job.set_state(JobState::AwaitingUserInput);
            } else {
                run_phase_two(job, context);
            }
        }
        Err(e) => fail_job(&job, e),
    }
}

/// Open the archive, enumerate components, probe each one. Returns whether
/// any component needs a user decision.
fn phase_one(job: &Arc<InstallJob>, context: &InstallContext) -> EngineResult<bool> {
    job.check_abort()?;

    logger::log_info(
        &format!("install job started: {:?}", job.archive_path),
        Some("install"),
    );

    let mut reader = ArchiveReader::open_file(&job.archive_path)?;
    let components = identify_components(&mut reader)?;
    if components.is_empty() {
        return Err(EngineError::bad_archive(
            "archive contains no installable components",
        ));
    }

    let mut plans = Vec::with_capacity(components.len());
    for component in components {
        job.check_abort()?;
        let verdict =
            probe_component(&component, &context.library_server, &context.preset_server)?;
        plans.push(Arc::new(PlannedComponent::new(component, verdict)));
    }

    let needs_input = plans.iter().any(|plan| plan.needs_user_input());
    *job.plans.lock().unwrap() = plans;
    *job.reader.lock().unwrap() = Some(reader);
    Ok(needs_input)
}

fn run_phase_two(job: Arc<InstallJob>, context: Arc<InstallContext>) {
    match phase_two(&job, &context) {
        Ok(()) => {
            logger::log_info(
                &format!("install job finished: {:?}", job.archive_path),
                Some("install"),
            );
            job.set_state(JobState::DoneSuccess);
        }
        Err(e) => fail_job(&job, e),
    }
}

fn phase_two(job: &Arc<InstallJob>, context: &InstallContext) -> EngineResult<()> {
    let plans = job.planned_components();
    let mut reader_guard = job.reader.lock().unwrap();
    let reader = reader_guard
        .as_mut()
        .ok_or_else(|| EngineError::Api("job has no open archive".to_string()))?;

    for plan in &plans {
        job.check_abort()?;

        let decision = plan.decision();
        if decision == UserDecision::Skip {
            continue;
        }

        let action = plan.verdict.required_action();
        match action {
            RequiredAction::NoActionRequired => continue,
            // No decision for a component that needed one: skip it rather
            // than guess.
            RequiredAction::UserInputRequired if decision != UserDecision::Overwrite => continue,
            _ => {}
        }

        // Replacing a known install (user said overwrite, or an unmodified
        // older version) goes through the side-rename path; fresh installs
        // resolve collisions with unique names instead.
        let overwrite_allowed =
            decision == UserDecision::Overwrite || plan.verdict.installed();

        // Libraries land in the first current scan folder; a folder removed
        // from the list between submission and now falls back to the
        // default resolved at startup.
        let dest_folder = if plan.component.is_library() {
            context
                .library_server
                .scan_folders()
                .into_iter()
                .next()
                .unwrap_or_else(|| context.libraries_dir.clone())
        } else {
            context.presets_dir.clone()
        };

        let transaction_context = transaction::TransactionContext {
            rng: &context.rng,
            generator_tag: &context.generator_tag,
        };
        transaction::install_component(
            reader,
            &plan.component,
            &dest_folder,
            overwrite_allowed,
            &transaction_context,
        )?;

        // Make the new library visible immediately instead of waiting for
        // filesystem notifications.
        if plan.component.is_library() {
            context.library_server.rescan_folder(&dest_folder);
        }
    }

    Ok(())
}

fn fail_job(job: &Arc<InstallJob>, error: EngineError) {
    if error.is_abort() {
        job.push_error("aborted".to_string());
    } else {
        logger::log_error(
            &format!("install job failed: {:?}: {}", job.archive_path, error),
            Some("install"),
        );
        job.push_error(error.to_string());
        reporting::report_message(
            Severity::Error,
            format!("install failed for {:?}: {}", job.archive_path, error),
            None,
        );
    }
    job.set_state(JobState::DoneError);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::build_zip;
    use crate::checksum::CHECKSUMS_FILE_NAME;
    use std::time::{Duration, Instant};

    fn write_archive(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let cursor = build_zip(entries);
        let path = dir.join("archive.zip");
        std::fs::write(&path, cursor.into_inner()).unwrap();
        path
    }

    fn core_entries(minor_version: u16) -> Vec<(String, Vec<u8>)> {
        vec![
            (
                "Core/floe-library.ini".to_string(),
                format!("author=FrozenPlain\nname=Core\nminor_version={}\n", minor_version)
                    .into_bytes(),
            ),
            ("Core/samples/a.flac".to_string(), b"flacdata".to_vec()),
        ]
    }

    struct Fixture {
        _root: tempfile::TempDir,
        pool: InstallJobPool,
        libraries_dir: PathBuf,
        library_server: Arc<SampleLibraryServer>,
        archive_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let libraries_dir = root.path().join("Libraries");
        let presets_dir = root.path().join("Presets");
        std::fs::create_dir_all(&libraries_dir).unwrap();
        std::fs::create_dir_all(&presets_dir).unwrap();

        let library_server =
            Arc::new(SampleLibraryServer::new(vec![libraries_dir.clone()]));
        library_server.rescan_all();
        let preset_server = Arc::new(PresetServer::new());

        let thread_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        );
        let context = Arc::new(InstallContext {
            library_server: library_server.clone(),
            preset_server,
            rng: Arc::new(RngHandle::seeded(11)),
            generator_tag: "Floe test".to_string(),
            libraries_dir: libraries_dir.clone(),
            presets_dir,
        });

        Fixture {
            archive_dir: root.path().to_path_buf(),
            _root: root,
            pool: InstallJobPool::new(thread_pool, context),
            libraries_dir,
            library_server,
        }
    }

    fn wait_for(job: &Arc<InstallJob>, predicate: impl Fn(JobState) -> bool) -> JobState {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let state = job.state();
            if predicate(state) {
                return state;
            }
            assert!(Instant::now() < deadline, "timed out waiting for job state");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_fresh_install_runs_both_phases() {
        let fixture = fixture();
        let entries = core_entries(3);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let archive = write_archive(&fixture.archive_dir, &entry_refs);

        let job = fixture.pool.submit(archive).unwrap();
        let state = wait_for(&job, JobState::is_terminal);

        assert_eq!(state, JobState::DoneSuccess, "{}", job.error_text());
        let installed = fixture.libraries_dir.join("Core");
        assert!(installed.join("samples/a.flac").exists());
        assert!(installed.join(CHECKSUMS_FILE_NAME).exists());

        // Phase 2 notified the server: the library is indexed already.
        assert_eq!(fixture.library_server.libraries().len(), 1);

        fixture.pool.reap_completed();
        assert!(fixture.pool.active_jobs().is_empty());
    }

    #[test]
    fn test_reinstall_unchanged_skips_filesystem() {
        let fixture = fixture();
        let entries = core_entries(3);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let archive = write_archive(&fixture.archive_dir, &entry_refs);

        let first = fixture.pool.submit(archive.clone()).unwrap();
        assert_eq!(wait_for(&first, JobState::is_terminal), JobState::DoneSuccess);

        let manifest_path = fixture
            .libraries_dir
            .join("Core")
            .join(CHECKSUMS_FILE_NAME);
        let mtime_before = std::fs::metadata(&manifest_path).unwrap().modified().unwrap();

        let second = fixture.pool.submit(archive).unwrap();
        assert_eq!(
            wait_for(&second, JobState::is_terminal),
            JobState::DoneSuccess,
            "{}",
            second.error_text()
        );

        // No second copy, no rewrite of the manifest.
        assert!(!fixture.libraries_dir.join("Core (1)").exists());
        let mtime_after = std::fs::metadata(&manifest_path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn test_modified_install_awaits_user_then_overwrites() {
        let fixture = fixture();
        let entries = core_entries(2);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let archive_v2 = write_archive(&fixture.archive_dir, &entry_refs);

        let first = fixture.pool.submit(archive_v2).unwrap();
        assert_eq!(wait_for(&first, JobState::is_terminal), JobState::DoneSuccess);
        fixture.pool.reap_completed();

        // User modifies a shipped file.
        std::fs::write(
            fixture.libraries_dir.join("Core/samples/a.flac"),
            b"edited!!",
        )
        .unwrap();

        let entries = core_entries(3);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let cursor = build_zip(&entry_refs);
        let archive_v3 = fixture.archive_dir.join("archive-v3.zip");
        std::fs::write(&archive_v3, cursor.into_inner()).unwrap();

        let job = fixture.pool.submit(archive_v3).unwrap();
        let state = wait_for(&job, |s| s != JobState::Installing);
        assert_eq!(state, JobState::AwaitingUserInput, "{}", job.error_text());

        let plans = job.planned_components();
        assert_eq!(plans.len(), 1);
        assert!(plans[0].needs_user_input());

        job.set_user_decision(0, UserDecision::Overwrite).unwrap();
        fixture.pool.resume(&job).unwrap();
        assert_eq!(
            wait_for(&job, JobState::is_terminal),
            JobState::DoneSuccess,
            "{}",
            job.error_text()
        );

        // New content in place, old folder trashed or deleted.
        assert_eq!(
            std::fs::read(fixture.libraries_dir.join("Core/samples/a.flac")).unwrap(),
            b"flacdata"
        );
        let stray: Vec<String> = std::fs::read_dir(&fixture.libraries_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("(old-"))
            .collect();
        assert!(stray.is_empty(), "side-renamed folder left behind: {:?}", stray);
    }

    #[test]
    fn test_modified_install_skip_leaves_disk_alone() {
        let fixture = fixture();
        let entries = core_entries(2);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let archive = write_archive(&fixture.archive_dir, &entry_refs);

        let first = fixture.pool.submit(archive).unwrap();
        assert_eq!(wait_for(&first, JobState::is_terminal), JobState::DoneSuccess);
        fixture.pool.reap_completed();

        std::fs::write(
            fixture.libraries_dir.join("Core/samples/a.flac"),
            b"edited!!",
        )
        .unwrap();

        let entries = core_entries(3);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let cursor = build_zip(&entry_refs);
        let archive_v3 = fixture.archive_dir.join("archive-v3.zip");
        std::fs::write(&archive_v3, cursor.into_inner()).unwrap();

        let job = fixture.pool.submit(archive_v3).unwrap();
        wait_for(&job, |s| s == JobState::AwaitingUserInput);
        job.set_user_decision(0, UserDecision::Skip).unwrap();
        fixture.pool.resume(&job).unwrap();
        assert_eq!(wait_for(&job, JobState::is_terminal), JobState::DoneSuccess);

        // The user's edit survives.
        assert_eq!(
            std::fs::read(fixture.libraries_dir.join("Core/samples/a.flac")).unwrap(),
            b"edited!!"
        );
    }

    #[test]
    fn test_bad_archive_fails_job() {
        let fixture = fixture();
        let path = fixture.archive_dir.join("broken.zip");
        std::fs::write(&path, b"this is not a zip").unwrap();

        let job = fixture.pool.submit(path).unwrap();
        assert_eq!(wait_for(&job, JobState::is_terminal), JobState::DoneError);
        assert!(job.error_text().contains("bad archive"));
    }

    #[test]
    fn test_abort_before_work() {
        let fixture = fixture();
        let entries = core_entries(3);
        let entry_refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(p, b)| (p.as_str(), b.as_slice()))
            .collect();
        let archive = write_archive(&fixture.archive_dir, &entry_refs);

        let job = fixture.pool.submit(archive).unwrap();
        job.request_abort();
        let state = wait_for(&job, JobState::is_terminal);

        // Either the worker saw the flag (aborted) or it had already
        // finished; both are valid terminal outcomes for a late abort.
        if state == JobState::DoneError {
            assert_eq!(job.error_text(), "aborted");
        }
    }

    #[test]
    fn test_preset_pack_duplicate_installs_second_copy() {
        let fixture = fixture();
        let pack_entries: Vec<(&str, &[u8])> = vec![
            (
                "Synthwave/floe-preset-pack.ini",
                b"subtitle=Retro\nminor_version=1\nid=synthwave\n".as_slice(),
            ),
            ("Synthwave/pad.floe-preset", b"patch".as_slice()),
        ];
        let archive = write_archive(&fixture.archive_dir, &pack_entries);

        let first = fixture.pool.submit(archive.clone()).unwrap();
        assert_eq!(wait_for(&first, JobState::is_terminal), JobState::DoneSuccess);
        fixture.pool.reap_completed();

        // The preset server has not rescanned: the probe under-reports and
        // the second install lands in a uniquely named folder.
        let second = fixture.pool.submit(archive).unwrap();
        assert_eq!(wait_for(&second, JobState::is_terminal), JobState::DoneSuccess);

        let presets_dir = fixture.archive_dir.join("Presets");
        assert!(presets_dir.join("Synthwave").exists());
        assert!(presets_dir.join("Synthwave (1)").exists());
    }
}
