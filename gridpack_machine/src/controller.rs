//! The controller: intents enqueued by the API are drained by a
//! lock-serialized periodic tick that drives every gridpack through its
//! state machine — local preparation, remote submission, job tracking,
//! output ingestion, artifact reuse and downstream request creation.
//!
//! Phase order within a tick is load-bearing: deletions and resets go
//! first, reuse probes and approvals next, then the HTCondor poll, request
//! creation, and finally submission of approved documents. Later phases
//! observe side effects of earlier ones. A failure in one phase or for
//! one document never aborts the rest of the tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use remote_executor::{RemoteSession, SessionProvider};
use tracing::{error, info, warn};

use crate::condor;
use crate::database::DocumentStore;
use crate::generator;
use crate::generator::fragment::FragmentBuilder;
use crate::gridpack::{CondorStatus, Gridpack, GridpackData, Status, AUTOMATIC_USER};
use crate::notifier::{Notification, Notifier};
use crate::repository::TemplateRepository;
use crate::resolver;
use crate::user::User;
use crate::{now_millis, now_seconds, MachineConf};

/// Quiet period after every tick, to rate-limit thrashing under rapid API
/// traffic.
const TICK_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct Intent {
    gridpack_id: String,
    user: String,
}

#[derive(Default)]
struct IntentQueues {
    to_delete: VecDeque<Intent>,
    to_reset: VecDeque<Intent>,
    to_check_reuse: VecDeque<Intent>,
    to_approve: VecDeque<Intent>,
    to_create_requests: VecDeque<Intent>,
}

pub struct Controller {
    conf: Arc<MachineConf>,
    store: Arc<dyn DocumentStore>,
    repository: Arc<TemplateRepository>,
    executor: Arc<dyn SessionProvider>,
    notifier: Notifier,
    queues: parking_lot::Mutex<IntentQueues>,
    tick_lock: tokio::sync::Mutex<()>,
    last_tick: AtomicI64,
}

impl Controller {
    pub fn new(
        conf: Arc<MachineConf>,
        store: Arc<dyn DocumentStore>,
        repository: Arc<TemplateRepository>,
        executor: Arc<dyn SessionProvider>,
        notifier: Notifier,
    ) -> Self {
        Controller {
            conf,
            store,
            repository,
            executor,
            notifier,
            queues: parking_lot::Mutex::new(IntentQueues::default()),
            tick_lock: tokio::sync::Mutex::new(()),
            last_tick: AtomicI64::new(0),
        }
    }

    pub fn last_tick(&self) -> i64 {
        self.last_tick.load(Ordering::SeqCst)
    }

    /// Assign an id, initialize the computed fields and persist the new
    /// document.
    pub async fn create(&self, data: GridpackData, user: &User) -> anyhow::Result<String> {
        let mut gridpack = Gridpack::make(data)?;
        gridpack.data.id = now_millis().to_string();
        let campaign = self.repository.campaign_card(&gridpack)?;
        gridpack.data.history.clear();
        gridpack.reset(&campaign);
        gridpack.add_history_entry(&user.username, "created");
        let gridpack_id = gridpack.id().to_string();
        if !self.store.create(&gridpack.data).await? {
            bail!("gridpack {gridpack_id} already exists");
        }
        info!("gridpack {gridpack} was created");
        Ok(gridpack_id)
    }

    pub fn approve(&self, gridpack_id: &str, user: &User) {
        info!("adding {gridpack_id} to approve list");
        self.queues.lock().to_approve.push_back(Intent {
            gridpack_id: gridpack_id.to_string(),
            user: user.username.clone(),
        });
    }

    pub fn reset(&self, gridpack_id: &str, user: &User) {
        info!("adding {gridpack_id} to reset list");
        self.queues.lock().to_reset.push_back(Intent {
            gridpack_id: gridpack_id.to_string(),
            user: user.username.clone(),
        });
    }

    pub fn delete(&self, gridpack_id: &str, user: &User) {
        info!("adding {gridpack_id} to delete list");
        self.queues.lock().to_delete.push_back(Intent {
            gridpack_id: gridpack_id.to_string(),
            user: user.username.clone(),
        });
    }

    pub fn create_request(&self, gridpack_id: &str, user: &User) {
        info!("adding {gridpack_id} to create request list");
        self.queues.lock().to_create_requests.push_back(Intent {
            gridpack_id: gridpack_id.to_string(),
            user: user.username.clone(),
        });
    }

    /// One serialized pass over the queues and the in-flight documents.
    pub async fn tick(&self) {
        let _tick = self.tick_lock.lock().await;
        info!("controller tick start");
        let started = Instant::now();
        self.internal_tick().await;
        self.last_tick.store(now_seconds(), Ordering::SeqCst);
        info!("tick completed in {:.2}s", started.elapsed().as_secs_f64());
        tokio::time::sleep(TICK_COOLDOWN).await;
    }

    async fn internal_tick(&self) {
        let to_delete = drain(&mut self.queues.lock().to_delete);
        if !to_delete.is_empty() {
            info!("gridpacks to delete: {}", intent_ids(&to_delete));
            for intent in &to_delete {
                if let Err(e) = self.delete_gridpack(intent).await {
                    error!("error deleting {}: {e:#}", intent.gridpack_id);
                }
            }
        }

        let to_reset = drain(&mut self.queues.lock().to_reset);
        if !to_reset.is_empty() {
            info!("gridpacks to reset: {}", intent_ids(&to_reset));
            for intent in &to_reset {
                if let Err(e) = self.reset_gridpack(intent).await {
                    error!("error resetting {}: {e:#}", intent.gridpack_id);
                }
            }
        }

        let to_check_reuse = drain(&mut self.queues.lock().to_check_reuse);
        if !to_check_reuse.is_empty() {
            info!("gridpacks to check for reuse: {}", intent_ids(&to_check_reuse));
            let mut session = self.executor.session();
            for intent in &to_check_reuse {
                if let Err(e) = self.probe_reuse(session.as_mut(), intent).await {
                    error!("error probing reuse for {}: {e:#}", intent.gridpack_id);
                }
            }
            session.close().await;
        }

        let to_approve = drain(&mut self.queues.lock().to_approve);
        if !to_approve.is_empty() {
            info!("gridpacks to approve: {}", intent_ids(&to_approve));
            for intent in &to_approve {
                if let Err(e) = self.approve_gridpack(intent).await {
                    error!("error approving {}: {e:#}", intent.gridpack_id);
                }
            }
        }

        if let Err(e) = self.check_running_gridpacks().await {
            error!("error checking running gridpacks: {e:#}");
        }

        let to_create_requests = drain(&mut self.queues.lock().to_create_requests);
        if !to_create_requests.is_empty() {
            info!(
                "gridpacks to create requests: {}",
                intent_ids(&to_create_requests)
            );
            for intent in &to_create_requests {
                if let Err(e) = self.create_request_for_gridpack(intent).await {
                    error!(
                        "error creating request for {}: {e:#}",
                        intent.gridpack_id
                    );
                }
            }
        }

        if let Err(e) = self.submit_approved_gridpacks().await {
            error!("error submitting approved gridpacks: {e:#}");
        }
    }

    async fn load(&self, gridpack_id: &str) -> anyhow::Result<Option<Gridpack>> {
        match self.store.get(gridpack_id).await? {
            Some(data) => Ok(Some(Gridpack::make(data)?)),
            None => Ok(None),
        }
    }

    /// Best-effort `condor_rm`; the job either is gone already or will be
    /// later, batch cleanup is idempotent.
    async fn terminate(&self, gridpack: &Gridpack) {
        info!("trying to terminate {gridpack}");
        let condor_id = gridpack.condor_id();
        if condor_id == 0 {
            info!("gridpack {gridpack} HTCondor id {condor_id} is not valid");
            return;
        }
        let mut session = self.executor.condor_session();
        if let Err(e) = session.execute(&[&format!("condor_rm {condor_id}")]).await {
            warn!("could not terminate job {condor_id} of {gridpack}: {e:#}");
        }
        session.close().await;
        info!("finished terminating gridpack {gridpack}");
    }

    async fn delete_gridpack(&self, intent: &Intent) -> anyhow::Result<()> {
        let Some(gridpack) = self.load(&intent.gridpack_id).await? else {
            return Ok(());
        };
        self.terminate(&gridpack).await;
        self.store.delete(&intent.gridpack_id).await?;
        let _ = std::fs::remove_dir_all(gridpack.local_dir(&self.conf));
        Ok(())
    }

    async fn reset_gridpack(&self, intent: &Intent) -> anyhow::Result<()> {
        let Some(mut gridpack) = self.load(&intent.gridpack_id).await? else {
            error!(
                "cannot reset {} because it is not in the database",
                intent.gridpack_id
            );
            return Ok(());
        };
        info!("resetting {gridpack}");
        self.terminate(&gridpack).await;
        let campaign = self.repository.campaign_card(&gridpack)?;
        gridpack.reset(&campaign);
        gridpack.add_history_entry(&intent.user, "reset");
        self.store.update(&gridpack.data).await?;
        Ok(())
    }

    async fn approve_gridpack(&self, intent: &Intent) -> anyhow::Result<()> {
        let Some(mut gridpack) = self.load(&intent.gridpack_id).await? else {
            error!(
                "cannot approve {} because it is not in the database",
                intent.gridpack_id
            );
            return Ok(());
        };
        info!("approving {gridpack}");

        let dataset = self.repository.dataset_card(&gridpack)?;
        if resolver::reuse_requested(&dataset) {
            gridpack.add_history_entry(&intent.user, "approve");
            match resolver::reusable_artifact_path(&gridpack, &self.conf, &dataset) {
                Ok(_) => {
                    // Eligible; the actual probe happens in the batched
                    // reuse phase of the next tick.
                    self.store.update(&gridpack.data).await?;
                    self.queues.lock().to_check_reuse.push_back(intent.clone());
                }
                Err(e) => {
                    warn!("{gridpack} cannot reuse a gridpack: {e:#}");
                    gridpack.set_status(Status::Failed);
                    gridpack.add_history_entry(AUTOMATIC_USER, "reuse failed");
                    self.store.update(&gridpack.data).await?;
                    self.notifier
                        .notify(Notification::ReuseFailed, &gridpack, Vec::new())
                        .await;
                }
            }
            return Ok(());
        }

        gridpack.set_status(Status::Approved);
        gridpack.add_history_entry(&intent.user, "approve");
        self.store.update(&gridpack.data).await?;
        Ok(())
    }

    /// Scan the artifact's storage folder; bind to the newest matching
    /// file or flip to failed.
    async fn probe_reuse(
        &self,
        session: &mut dyn RemoteSession,
        intent: &Intent,
    ) -> anyhow::Result<()> {
        let Some(mut gridpack) = self.load(&intent.gridpack_id).await? else {
            error!(
                "cannot probe reuse for {} because it is not in the database",
                intent.gridpack_id
            );
            return Ok(());
        };

        let dataset = self.repository.dataset_card(&gridpack)?;
        let candidate = match resolver::reusable_artifact_path(&gridpack, &self.conf, &dataset) {
            Ok(artifact_path) => resolver::probe(session, &artifact_path).await?,
            Err(e) => {
                warn!("{gridpack} has no valid reuse path: {e:#}");
                None
            }
        };

        match candidate {
            Some(candidate) => {
                info!("{gridpack} reuses {}", candidate.absolute_path);
                let lineage =
                    resolver::find_lineage(self.store.as_ref(), &gridpack, &candidate.file_name)
                        .await?;
                if lineage == "-1" {
                    warn!(
                        "no originating gridpack found for {}",
                        candidate.file_name
                    );
                }
                gridpack.data.gridpack_reused = lineage;
                gridpack.data.archive = candidate.file_name;
                gridpack.data.archive_absolute = candidate.absolute_path.to_string();
                gridpack.clear_cores_memory();
                gridpack.set_status(Status::Reused);
                gridpack.add_history_entry(AUTOMATIC_USER, "reused");
                self.store.update(&gridpack.data).await?;
                self.notifier
                    .notify(Notification::Reused, &gridpack, Vec::new())
                    .await;
                self.queues.lock().to_create_requests.push_back(Intent {
                    gridpack_id: intent.gridpack_id.clone(),
                    user: AUTOMATIC_USER.to_string(),
                });
            }
            None => {
                gridpack.set_status(Status::Failed);
                gridpack.add_history_entry(AUTOMATIC_USER, "reuse failed");
                self.store.update(&gridpack.data).await?;
                self.notifier
                    .notify(Notification::ReuseFailed, &gridpack, Vec::new())
                    .await;
            }
        }
        Ok(())
    }

    /// Poll HTCondor for every in-flight document, ingest finished jobs
    /// and stream the stdout of running ones.
    async fn check_running_gridpacks(&self) -> anyhow::Result<()> {
        let in_flight = self.store.with_status(&Status::IN_FLIGHT).await?;
        if in_flight.is_empty() {
            return Ok(());
        }
        info!(
            "gridpacks to check: {}",
            in_flight
                .iter()
                .map(|gridpack| gridpack.id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );

        let mut session = self.executor.condor_session();
        let jobs = match condor::jobs_in_condor(session.as_mut()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        for data in in_flight {
            let gridpack_id = data.id.clone();
            if let Err(e) = self.check_gridpack(session.as_mut(), data, &jobs).await {
                error!("error checking {gridpack_id}: {e:#}");
            }
        }
        session.close().await;
        Ok(())
    }

    async fn check_gridpack(
        &self,
        session: &mut dyn RemoteSession,
        data: GridpackData,
        jobs: &std::collections::HashMap<u64, CondorStatus>,
    ) -> anyhow::Result<()> {
        let mut gridpack = Gridpack::make(data)?;
        let observed = jobs
            .get(&gridpack.condor_id())
            .copied()
            .unwrap_or(CondorStatus::Removed);
        info!("saving {gridpack} condor status as {observed}");
        if observed != gridpack.condor_status() {
            gridpack.add_history_entry(AUTOMATIC_USER, &format!("job {observed}"));
        }
        gridpack.set_condor_status(observed);
        if observed == CondorStatus::Run && gridpack.status() == Status::Submitted {
            gridpack.set_status(Status::Running);
        }
        self.store.update(&gridpack.data).await?;

        match observed {
            CondorStatus::Done | CondorStatus::Removed => {
                self.collect_output(&mut gridpack).await?;
            }
            CondorStatus::Run => {
                let log_path = format!(
                    "{}/GRIDPACK_GENERATION_{}.log",
                    self.conf.public_stream_folder,
                    gridpack.id()
                );
                if let Err(e) =
                    condor::stream_job_log(session, gridpack.condor_id(), &log_path).await
                {
                    warn!("could not stream job output of {gridpack}: {e:#}");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Download the job logs, file the produced archive under the storage
    /// root, clean the remote namespace and finish the document.
    async fn collect_output(&self, gridpack: &mut Gridpack) -> anyhow::Result<()> {
        let condor_status = gridpack.condor_status();
        if !matches!(condor_status, CondorStatus::Done | CondorStatus::Removed) {
            info!("{gridpack} status is not DONE or REMOVED, it is {condor_status}");
            return Ok(());
        }

        info!("collecting output for {gridpack}");
        let remote_dir = gridpack.remote_dir(&self.conf);
        let local_dir = gridpack.local_dir(&self.conf);
        std::fs::create_dir_all(&local_dir).with_context(|| format!("creating {local_dir}"))?;
        let dataset = gridpack.data.dataset.clone();

        let mut session = self.executor.session();
        for log_name in ["job.log", "output.log", "error.log"] {
            session
                .download_file(&format!("{remote_dir}/{log_name}"), &local_dir.join(log_name))
                .await;
        }

        let listing = session
            .execute(&[&format!("ls -1 {remote_dir}/*{dataset}*.t*z")])
            .await?;
        let archive = pick_archive(&listing.stdout, &dataset);

        let mut rsync_failed = false;
        if let Some(archive_name) = &archive {
            let storage_path = gridpack.remote_storage_path(&self.conf)?;
            info!("copying gridpack {remote_dir}/{archive_name} -> {storage_path}");

            // rsync does not create the destination directory; make sure
            // it exists through a second session first.
            let mut storage_session = self.executor.session();
            if let Err(e) = storage_session
                .execute(&[&format!("mkdir -p {storage_path}")])
                .await
            {
                warn!("could not pre-create {storage_path}: {e:#}");
            }
            storage_session.close().await;

            let rsync = format!(
                "rsync -av -e \"ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null\" \
                 {remote_dir}/{archive_name} {}:{storage_path}",
                self.conf.submission_host
            );
            let output = session.execute(&[&rsync]).await?;
            if output.exit_code != 0 {
                error!(
                    "rsync of {archive_name} returned {}:\n{}",
                    output.exit_code, output.stderr
                );
                rsync_failed = true;
            }
        }

        if let Err(e) = session.execute(&[&format!("rm -rf {remote_dir}")]).await {
            warn!("could not remove {remote_dir}: {e:#}");
        }
        session.close().await;

        gridpack.data.archive = archive.clone().unwrap_or_default();
        gridpack.data.archive_absolute.clear();
        gridpack.absolute_path(&self.conf)?;

        let mut collected: Vec<Utf8PathBuf> = ["job.log", "output.log", "error.log"]
            .iter()
            .map(|log_name| local_dir.join(log_name))
            .collect();
        collected.push(local_dir.join(format!("GRIDPACK_{}.sh", gridpack.id())));
        collected.push(local_dir.join("input_files.tar.gz"));
        let attachments = zip_attachment(&local_dir, gridpack.id(), "files", &collected)?;

        if gridpack.status() == Status::Failed {
            gridpack.add_history_entry(AUTOMATIC_USER, "failed");
            self.store.update(&gridpack.data).await?;
            self.notifier
                .notify(Notification::Failed, gridpack, attachments)
                .await;
        } else if archive.is_none() || rsync_failed {
            gridpack.set_status(Status::Failed);
            gridpack.add_history_entry(AUTOMATIC_USER, "failed");
            self.store.update(&gridpack.data).await?;
            self.notifier
                .notify(Notification::Failed, gridpack, attachments)
                .await;
        } else {
            gridpack.set_status(Status::Done);
            gridpack.add_history_entry(AUTOMATIC_USER, "done");
            self.store.update(&gridpack.data).await?;
            self.notifier
                .notify(Notification::Done, gridpack, attachments)
                .await;
            self.queues.lock().to_create_requests.push_back(Intent {
                gridpack_id: gridpack.id().to_string(),
                user: AUTOMATIC_USER.to_string(),
            });
        }

        let _ = std::fs::remove_dir_all(&local_dir);
        Ok(())
    }

    /// Upload the helper script and the fragment, run the request creation
    /// remotely and persist the returned prepid.
    async fn create_request_for_gridpack(&self, intent: &Intent) -> anyhow::Result<()> {
        let Some(mut gridpack) = self.load(&intent.gridpack_id).await? else {
            error!(
                "cannot create request for {} because it is not in the database",
                intent.gridpack_id
            );
            return Ok(());
        };
        info!("creating request for {gridpack}");
        gridpack.add_history_entry(&intent.user, "create request");

        let artifact =
            resolver::effective_artifact(self.store.as_ref(), &self.conf, &mut gridpack).await;
        let archive_path = match artifact {
            Ok((archive_path, _)) => archive_path,
            Err(e) => {
                warn!("{gridpack} has no valid archive for a request: {e:#}");
                gridpack.set_status(Status::Failed);
                self.store.update(&gridpack.data).await?;
                self.notifier
                    .notify(Notification::InvalidOutput, &gridpack, Vec::new())
                    .await;
                return Ok(());
            }
        };

        let fragment = FragmentBuilder::new(&self.repository).build_fragment(&gridpack, &archive_path)?;
        let campaign = self.repository.campaign_card(&gridpack)?;
        let remote_dir = format!("{}/{}", self.conf.tickets_directory, gridpack.id());
        let script_name = self
            .conf
            .request_script_path
            .file_name()
            .unwrap_or("mcm_gridpack.py");

        let mut session = self.executor.session();
        let result = async {
            session
                .execute(&[
                    &format!("rm -rf {remote_dir}"),
                    &format!("mkdir -p {remote_dir}"),
                ])
                .await?;
            if !session
                .upload_file(
                    &self.conf.request_script_path,
                    &format!("{remote_dir}/{script_name}"),
                )
                .await
            {
                bail!("could not upload the request creation script");
            }
            if !session
                .upload_as_file(fragment.as_bytes(), &format!("{remote_dir}/fragment.py"))
                .await
            {
                bail!("could not upload the fragment");
            }

            let dev_flag = if self.conf.production { "" } else { "--dev " };
            let command = format!(
                "python3 {script_name} {dev_flag}\
                 --fragment \"fragment.py\" \
                 --chain \"{}\" \
                 --dataset \"{}\" \
                 --events \"{}\" \
                 --tag \"{}\" \
                 --generator \"{}\"",
                campaign.chain,
                gridpack.data.dataset_name,
                gridpack.data.events,
                gridpack.data.campaign,
                gridpack.data.generator,
            );
            let output = session
                .execute(&[&format!("cd {remote_dir}"), &command])
                .await?;
            session
                .execute(&[&format!("rm -rf {remote_dir}")])
                .await?;
            anyhow::Ok(output)
        }
        .await;
        session.close().await;
        let output = result?;

        match parse_prepid(&output.stdout) {
            Some(prepid) => gridpack.set_prepid(&prepid),
            None => warn!(
                "no prepid in request creation output for {gridpack}:\n{}",
                output.stdout
            ),
        }
        self.store.update(&gridpack.data).await?;
        Ok(())
    }

    async fn submit_approved_gridpacks(&self) -> anyhow::Result<()> {
        let approved = self.store.with_status(&[Status::Approved]).await?;
        if approved.is_empty() {
            return Ok(());
        }
        info!(
            "gridpacks to submit: {}",
            approved
                .iter()
                .map(|gridpack| gridpack.id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );

        for data in approved {
            let mut gridpack = match Gridpack::make(data) {
                Ok(gridpack) => gridpack,
                Err(e) => {
                    error!("skipping unsubmittable document: {e:#}");
                    continue;
                }
            };
            // Double check; only approved documents are submittable.
            if gridpack.status() != Status::Approved {
                continue;
            }
            if let Err(e) = self.submit_to_condor(&mut gridpack).await {
                error!("exception while trying to submit {gridpack}: {e:#}");
                gridpack.set_status(Status::Failed);
                gridpack.add_history_entry(AUTOMATIC_USER, "submission failed");
                if let Err(e) = self.store.update(&gridpack.data).await {
                    error!("could not persist failed submission of {gridpack}: {e:#}");
                }
                self.notifier
                    .notify(Notification::Failed, &gridpack, Vec::new())
                    .await;
            }
        }
        Ok(())
    }

    /// The submission procedure: build the input archive, the script and
    /// the job description locally, stage them in the remote namespace
    /// and `condor_submit`.
    async fn submit_to_condor(&self, gridpack: &mut Gridpack) -> anyhow::Result<()> {
        info!("submitting {gridpack}");
        let gridpack_id = gridpack.id().to_string();
        let local_dir = gridpack.local_dir(&self.conf);
        let _ = std::fs::remove_dir_all(&local_dir);
        std::fs::create_dir_all(&local_dir).with_context(|| format!("creating {local_dir}"))?;

        info!("will create files for {gridpack}");
        let dataset_card = self.repository.dataset_card(gridpack)?;
        let campaign_card = self.repository.campaign_card(gridpack)?;
        generator::prepare_job_archive(gridpack, &self.conf, &dataset_card, &campaign_card)?;

        let script_path = local_dir.join(format!("GRIDPACK_{gridpack_id}.sh"));
        std::fs::write(&script_path, gridpack.render_script(&self.conf))
            .with_context(|| format!("writing {script_path}"))?;
        make_executable(&script_path)?;

        let jds_path = local_dir.join(format!("GRIDPACK_{gridpack_id}.jds"));
        std::fs::write(
            &jds_path,
            gridpack.render_jds(self.executor.accounting_group()),
        )
        .with_context(|| format!("writing {jds_path}"))?;

        info!("will prepare remote directory for {gridpack}");
        let remote_dir = gridpack.remote_dir(&self.conf);
        let mut session = self.executor.condor_session();
        let result = async {
            session
                .execute(&[
                    &format!("rm -rf {remote_dir}"),
                    &format!("mkdir -p {remote_dir}"),
                ])
                .await?;

            info!("will upload files for {gridpack}");
            for file_name in [
                format!("GRIDPACK_{gridpack_id}.sh"),
                format!("GRIDPACK_{gridpack_id}.jds"),
                "input_files.tar.gz".to_string(),
            ] {
                if !session
                    .upload_file(&local_dir.join(&file_name), &format!("{remote_dir}/{file_name}"))
                    .await
                {
                    bail!("could not upload {file_name}");
                }
            }

            info!("will try to submit {gridpack}");
            // Submission happens over SSH; HTCondor is not available on
            // the machine running this service.
            session
                .execute(&[
                    &format!("cd {remote_dir}"),
                    &format!("condor_submit GRIDPACK_{gridpack_id}.jds"),
                ])
                .await
        }
        .await;
        session.close().await;
        let output = result?;

        if let Some(condor_id) = parse_submission(&output.stdout) {
            gridpack.set_status(Status::Submitted);
            gridpack.set_condor_id(condor_id);
            gridpack.add_history_entry(AUTOMATIC_USER, "submitted");
            gridpack.add_history_entry(AUTOMATIC_USER, &format!("job {}", CondorStatus::Idle));
            gridpack.set_condor_status(CondorStatus::Idle);
            info!("submitted {gridpack}, condor job id {condor_id}");
            self.store.update(&gridpack.data).await?;

            let attachments = zip_attachment(
                &local_dir,
                &gridpack_id,
                "input_files",
                &[
                    local_dir.join(format!("GRIDPACK_{gridpack_id}.sh")),
                    local_dir.join("input_files.tar.gz"),
                ],
            )?;
            self.notifier
                .notify(Notification::Submitted, gridpack, attachments)
                .await;
        } else {
            error!(
                "error submitting {gridpack}.\noutput: {}.\nerror: {}",
                output.stdout, output.stderr
            );
            gridpack.set_status(Status::Failed);
            gridpack.add_history_entry(AUTOMATIC_USER, "submission failed");
            self.store.update(&gridpack.data).await?;
            self.notifier
                .notify(Notification::Failed, gridpack, Vec::new())
                .await;
        }
        Ok(())
    }
}

fn drain(queue: &mut VecDeque<Intent>) -> Vec<Intent> {
    queue.drain(..).collect()
}

fn intent_ids(intents: &[Intent]) -> String {
    intents
        .iter()
        .map(|intent| intent.gridpack_id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// First file in the listing that carries the dataset id and a gridpack
/// archive suffix.
fn pick_archive(stdout: &str, dataset: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.rsplit('/').next())
        .find(|name| {
            name.contains(dataset)
                && (name.ends_with(".tar.xz")
                    || name.ends_with(".tar.gz")
                    || name.ends_with(".tgz"))
        })
        .map(str::to_string)
}

/// Cluster id from the `condor_submit` confirmation, e.g.
/// `1 job(s) submitted to cluster 801341.`
fn parse_submission(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .find(|line| line.contains("1 job(s) submitted to cluster"))
        .and_then(|line| line.split_whitespace().last())
        .and_then(|token| token.trim_end_matches('.').parse().ok())
}

/// `REQUEST PREPID: <id>` line printed by the request creation script.
fn parse_prepid(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("REQUEST PREPID:"))
        .map(|prepid| prepid.trim().to_string())
        .filter(|prepid| !prepid.is_empty())
}

#[cfg(unix)]
fn make_executable(path: &camino::Utf8Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o755);
    std::fs::set_permissions(path, permissions).with_context(|| format!("chmod {path}"))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &camino::Utf8Path) -> anyhow::Result<()> {
    Ok(())
}

/// Bundle the existing files into a deflate zip next to them; `None` when
/// nothing was collected.
fn zip_attachment(
    local_dir: &camino::Utf8Path,
    gridpack_id: &str,
    suffix: &str,
    files: &[Utf8PathBuf],
) -> anyhow::Result<Vec<Utf8PathBuf>> {
    use std::io::Write;

    let existing: Vec<&Utf8PathBuf> = files.iter().filter(|path| path.exists()).collect();
    if existing.is_empty() {
        return Ok(Vec::new());
    }

    let zip_path = local_dir.join(format!("gridpack_{gridpack_id}_{suffix}.zip"));
    let zip_file =
        std::fs::File::create(&zip_path).with_context(|| format!("creating {zip_path}"))?;
    let mut writer = zip::ZipWriter::new(zip_file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for path in existing {
        let name = path.file_name().unwrap_or("file");
        writer.start_file(name, options)?;
        writer.write_all(&std::fs::read(path)?)?;
    }
    writer.finish()?;
    Ok(vec![zip_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemStore;
    use crate::gridpack::tests::test_data;
    use crate::notifier::{Email, Mailer};
    use crate::repository::tests::{repository_for, write_template_tree};
    use camino_tempfile::Utf8TempDir;
    use parking_lot::Mutex;
    use remote_executor::CommandOutput;

    #[derive(Default)]
    struct MockRemote {
        condor_rounds: VecDeque<String>,
        submit_stdout: String,
        archive_listing: String,
        reuse_listing: String,
        request_stdout: String,
        commands: Vec<String>,
        uploads: Vec<String>,
    }

    impl MockRemote {
        fn ran(&self, fragment: &str) -> bool {
            self.commands.iter().any(|command| command.contains(fragment))
        }
    }

    struct MockSession {
        state: Arc<Mutex<MockRemote>>,
    }

    #[async_trait::async_trait]
    impl RemoteSession for MockSession {
        async fn execute(&mut self, commands: &[&str]) -> anyhow::Result<CommandOutput> {
            let command = commands.join("; ");
            let mut state = self.state.lock();
            state.commands.push(command.clone());
            let ok = |stdout: String| {
                Ok(CommandOutput {
                    stdout,
                    stderr: String::new(),
                    exit_code: 0,
                })
            };
            if command.contains("condor_q") {
                let round = state.condor_rounds.pop_front().unwrap_or_default();
                return ok(round);
            }
            if command.contains("condor_submit") {
                return ok(state.submit_stdout.clone());
            }
            if command.starts_with("ls -1") {
                return ok(state.archive_listing.clone());
            }
            if command.starts_with("ls -l --time-style") {
                return ok(state.reuse_listing.clone());
            }
            if command.contains("python3") {
                return ok(state.request_stdout.clone());
            }
            ok(String::new())
        }

        async fn upload_file(&mut self, _copy_from: &camino::Utf8Path, copy_to: &str) -> bool {
            self.state.lock().uploads.push(copy_to.to_string());
            true
        }

        async fn upload_as_file(&mut self, _content: &[u8], copy_to: &str) -> bool {
            self.state.lock().uploads.push(copy_to.to_string());
            true
        }

        async fn download_file(&mut self, _copy_from: &str, copy_to: &camino::Utf8Path) -> bool {
            std::fs::write(copy_to, "log contents").is_ok()
        }

        async fn download_as_string(&mut self, _copy_from: &str) -> Option<String> {
            None
        }

        async fn close(&mut self) {}
    }

    struct MockProvider {
        state: Arc<Mutex<MockRemote>>,
    }

    impl SessionProvider for MockProvider {
        fn session(&self) -> Box<dyn RemoteSession> {
            Box::new(MockSession {
                state: self.state.clone(),
            })
        }

        fn condor_session(&self) -> Box<dyn RemoteSession> {
            Box::new(MockSession {
                state: self.state.clone(),
            })
        }

        fn accounting_group(&self) -> &'static str {
            "group_u_CMS.u_zh.priority"
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Email>>,
    }

    impl Mailer for RecordingMailer {
        fn send(&self, email: &Email) -> anyhow::Result<()> {
            self.sent.lock().push(email.clone());
            Ok(())
        }
    }

    struct Harness {
        _tree_root: Utf8TempDir,
        _workdir: Utf8TempDir,
        conf: Arc<MachineConf>,
        store: Arc<MemStore>,
        remote: Arc<Mutex<MockRemote>>,
        mailer: Arc<RecordingMailer>,
        controller: Controller,
    }

    impl Harness {
        fn new() -> Self {
            let tree_root = Utf8TempDir::new().unwrap();
            write_template_tree(&tree_root);
            let workdir = Utf8TempDir::new().unwrap();

            let mut conf = MachineConf::dummy();
            conf.gridpack_files_path = tree_root.path().to_path_buf();
            conf.workdir = workdir.path().to_path_buf();
            let conf = Arc::new(conf);

            let store = Arc::new(MemStore::new());
            let repository = Arc::new(repository_for(conf.clone()));
            let remote = Arc::new(Mutex::new(MockRemote {
                submit_stdout: "1 job(s) submitted to cluster 801341.".to_string(),
                request_stdout: "REQUEST PREPID: GEN-Run3Summer23-00001".to_string(),
                ..MockRemote::default()
            }));
            let mailer = Arc::new(RecordingMailer::default());
            let notifier = Notifier::new(mailer.clone(), &conf);
            let controller = Controller::new(
                conf.clone(),
                store.clone(),
                repository,
                Arc::new(MockProvider {
                    state: remote.clone(),
                }),
                notifier,
            );
            Harness {
                _tree_root: tree_root,
                _workdir: workdir,
                conf,
                store,
                remote,
                mailer,
                controller,
            }
        }

        fn operator() -> User {
            User {
                username: "walter".to_string(),
                name: "Walter Example".to_string(),
                email: "walter@cern.ch".to_string(),
                authorized: true,
            }
        }

        async fn create(&self) -> String {
            let mut data = test_data("ignored");
            data.history.clear();
            self.controller
                .create(data, &Self::operator())
                .await
                .unwrap()
        }

        async fn stored(&self, gridpack_id: &str) -> GridpackData {
            self.store.get(gridpack_id).await.unwrap().unwrap()
        }

        fn actions(&self, data: &GridpackData) -> Vec<String> {
            data.history.iter().map(|entry| entry.action.clone()).collect()
        }

        fn condor_round(&self, condor_id: u64, code: &str) {
            self.remote.lock().condor_rounds.push_back(format!(
                "ClusterId JobStatus Cmd\n{condor_id} {code} /afs/work/GRIDPACK_x.sh\n"
            ));
        }

        /// Rewrite the dataset card to request artifact reuse.
        fn request_reuse(&self, gridpack_path: Option<&str>) {
            let card_path = self
                .conf
                .gridpack_files_path
                .join("Cards/MadGraph5_aMCatNLO/P/D_NLO/D_NLO.json");
            let mut card: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&card_path).unwrap()).unwrap();
            card["gridpack_submit"] = serde_json::Value::Bool(false);
            if let Some(path) = gridpack_path {
                card["gridpack_path"] = serde_json::Value::String(path.to_string());
            }
            std::fs::write(&card_path, card.to_string()).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn s1_happy_submit_to_done() {
        let harness = Harness::new();
        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());

        // Tick 1: approve + submit.
        harness.controller.tick().await;
        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Submitted);
        assert_eq!(data.condor_id, 801341);
        assert_eq!(data.condor_status, CondorStatus::Idle);

        // Tick 2: the job runs.
        harness.condor_round(801341, "2");
        harness.controller.tick().await;
        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Running);
        assert!(harness.remote.lock().ran("condor_ssh_to_job 801341"));

        // Tick 3: done, output collected, request created.
        harness.remote.lock().archive_listing =
            "/afs/work/gridpacks/x/D_NLO_TuneCP5_13TeV.tar.xz\n".to_string();
        harness.condor_round(801341, "4");
        harness.controller.tick().await;

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Done);
        assert_eq!(data.archive, "D_NLO_TuneCP5_13TeV.tar.xz");
        assert_eq!(
            data.archive_absolute,
            "/eos/dev/gridpacks/C1/D_NLO_TuneCP5_13TeV.tar.xz"
        );
        assert_eq!(data.prepid, "GEN-Run3Summer23-00001");
        assert_eq!(
            harness.actions(&data),
            vec![
                "created",
                "approve",
                "submitted",
                "job IDLE",
                "job RUN",
                "job DONE",
                "done",
                "create request",
            ]
        );

        let subjects: Vec<String> = harness
            .mailer
            .sent
            .lock()
            .iter()
            .map(|email| email.subject.clone())
            .collect();
        assert!(subjects.iter().any(|subject| subject.contains("was submitted")));
        assert!(subjects.iter().any(|subject| subject.contains("is done")));
    }

    #[tokio::test(start_paused = true)]
    async fn s2_reuse_hit_links_lineage() {
        let harness = Harness::new();
        harness.request_reuse(Some(r"P/^D_NLO.*\.tar\.xz$"));
        harness.remote.lock().reuse_listing =
            "1700000100 D_NLO_v1.tar.xz\n1700000200 D_NLO_v2.tar.xz\n".to_string();

        // A prior document produced the newest artifact.
        let mut producer = test_data("1690000000000");
        producer.archive = "D_NLO_v2.tar.xz".to_string();
        producer.status = Status::Done;
        harness.store.create(&producer).await.unwrap();

        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());
        harness.controller.tick().await; // approve, queue the probe
        harness.controller.tick().await; // probe + request creation

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Reused);
        assert_eq!(data.gridpack_reused, "1690000000000");
        assert_eq!(data.archive, "D_NLO_v2.tar.xz");
        assert_eq!(
            data.archive_absolute,
            r"/eos/dev/gridpacks/C1/MadGraph5_aMCatNLO/P/D_NLO_v2.tar.xz"
        );
        assert_eq!(data.job_cores, None);
        assert_eq!(data.job_memory, None);
        assert_eq!(data.prepid, "GEN-Run3Summer23-00001");
        assert!(!harness.remote.lock().ran("condor_submit"));
        assert!(harness
            .mailer
            .sent
            .lock()
            .iter()
            .any(|email| email.subject.contains("reused")));
    }

    #[tokio::test(start_paused = true)]
    async fn s3_reuse_hit_without_lineage() {
        let harness = Harness::new();
        harness.request_reuse(Some(r"P/^D_NLO.*\.tar\.xz$"));
        harness.remote.lock().reuse_listing = "1700000200 D_NLO_v2.tar.xz\n".to_string();

        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());
        harness.controller.tick().await;
        harness.controller.tick().await;

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Reused);
        assert_eq!(data.gridpack_reused, "-1");
    }

    #[tokio::test(start_paused = true)]
    async fn s4_reuse_miss_fails_with_notification() {
        let harness = Harness::new();
        harness.request_reuse(Some(r"P/^D_NLO.*\.tar\.xz$"));
        // Storage lists nothing matching.

        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());
        harness.controller.tick().await;
        harness.controller.tick().await;

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Failed);
        assert_eq!(harness.actions(&data).last().unwrap(), "reuse failed");
        assert!(harness
            .mailer
            .sent
            .lock()
            .iter()
            .any(|email| email.subject.contains("reuse failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_without_path_never_becomes_submittable() {
        let harness = Harness::new();
        harness.request_reuse(None);

        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());
        harness.controller.tick().await;
        harness.controller.tick().await;

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Failed);
        assert!(!harness.remote.lock().ran("condor_submit"));
    }

    #[tokio::test(start_paused = true)]
    async fn s5_submission_parse_failure() {
        let harness = Harness::new();
        harness.remote.lock().submit_stdout = "something went terribly wrong".to_string();

        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());
        harness.controller.tick().await;

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Failed);
        assert_eq!(data.condor_id, 0);
        assert_eq!(harness.actions(&data).last().unwrap(), "submission failed");
    }

    #[tokio::test(start_paused = true)]
    async fn s6_reset_in_flight_terminates_and_does_not_resubmit() {
        let harness = Harness::new();
        let mut data = test_data("1700000000042");
        data.status = Status::Running;
        data.condor_id = 42;
        data.condor_status = CondorStatus::Run;
        harness.store.create(&data).await.unwrap();

        harness
            .controller
            .reset("1700000000042", &Harness::operator());
        harness.controller.tick().await;

        let data = harness.stored("1700000000042").await;
        assert_eq!(data.status, Status::New);
        assert_eq!(data.condor_id, 0);
        assert_eq!(data.condor_status, CondorStatus::Unset);
        assert_eq!(harness.actions(&data).last().unwrap(), "reset");
        assert!(harness.remote.lock().ran("condor_rm 42"));

        // A further tick does not resubmit: only approved is submittable.
        harness.controller.tick().await;
        let data = harness.stored("1700000000042").await;
        assert_eq!(data.status, Status::New);
        assert!(!harness.remote.lock().ran("condor_submit"));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_without_intents_is_a_noop_on_the_store() {
        let harness = Harness::new();
        let mut done = test_data("1700000000001");
        done.status = Status::Done;
        done.archive = "D_NLO.tar.xz".to_string();
        harness.store.create(&done).await.unwrap();

        let before = serde_json::to_value(harness.store.get_all().await.unwrap()).unwrap();
        harness.controller.tick().await;
        harness.controller.tick().await;
        let after = serde_json::to_value(harness.store.get_all().await.unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_terminates_job_and_removes_document() {
        let harness = Harness::new();
        let mut data = test_data("1700000000099");
        data.status = Status::Running;
        data.condor_id = 99;
        harness.store.create(&data).await.unwrap();

        harness
            .controller
            .delete("1700000000099", &Harness::operator());
        harness.controller.tick().await;

        assert!(harness.store.get("1700000000099").await.unwrap().is_none());
        assert!(harness.remote.lock().ran("condor_rm 99"));

        // Deleting a missing document is a no-op.
        harness
            .controller
            .delete("1700000000099", &Harness::operator());
        harness.controller.tick().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removed_job_without_archive_fails() {
        let harness = Harness::new();
        let gridpack_id = harness.create().await;
        harness.controller.approve(&gridpack_id, &Harness::operator());
        harness.controller.tick().await;

        // The queue no longer knows the job and no archive exists.
        harness.condor_round(999999, "2");
        harness.controller.tick().await;

        let data = harness.stored(&gridpack_id).await;
        assert_eq!(data.status, Status::Failed);
        assert_eq!(data.condor_status, CondorStatus::Removed);
        assert!(data.archive.is_empty());
        assert!(harness
            .mailer
            .sent
            .lock()
            .iter()
            .any(|email| email.subject.contains("job failed")));
    }

    #[test]
    fn submission_output_parsing() {
        assert_eq!(
            parse_submission("Submitting job(s).\n1 job(s) submitted to cluster 801341."),
            Some(801341)
        );
        assert_eq!(
            parse_submission("1 job(s) submitted to cluster 801341"),
            Some(801341)
        );
        assert_eq!(parse_submission("Submitting job(s)\nERROR"), None);
    }

    #[test]
    fn archive_picking_wants_dataset_and_suffix() {
        let stdout = "/afs/work/1/D_NLO_slc7_amd64.log\n\
                      /afs/work/1/D_NLO_TuneCP5_13TeV.tar.xz\n";
        assert_eq!(
            pick_archive(stdout, "D_NLO"),
            Some("D_NLO_TuneCP5_13TeV.tar.xz".to_string())
        );
        assert_eq!(pick_archive(stdout, "OTHER"), None);
        assert_eq!(pick_archive("", "D_NLO"), None);
    }

    #[test]
    fn prepid_parsing() {
        assert_eq!(
            parse_prepid("noise\nREQUEST PREPID: GEN-X-001\nmore"),
            Some("GEN-X-001".to_string())
        );
        assert_eq!(parse_prepid("REQUEST PREPID:"), None);
        assert_eq!(parse_prepid("nothing"), None);
    }
}
