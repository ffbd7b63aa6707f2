//! The gridpack document: schema, state enums, computed names and paths,
//! history log, and the rendering of the per-job submission files.

use anyhow::bail;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::check_append_path;
use crate::repository::{CampaignCard, RepositoryTree};
use crate::MachineConf;

/// Minimum memory per requested core, in MB.
pub const MEMORY_FACTOR_MB: u32 = 1_000;
/// `RequestDisk` is expressed in KB; jobs get a flat 30 GB scratch.
const DISK_FACTOR_KB_PER_GB: u64 = 1_000_000;

pub const DEFAULT_JOB_CORES: u32 = 16;
pub const DEFAULT_JOB_MEMORY: u32 = 32_000;

/// Actor recorded in history entries for controller-driven mutations.
pub const AUTOMATIC_USER: &str = "automatic";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    #[default]
    New,
    Approved,
    Submitted,
    Running,
    Finishing,
    Done,
    Failed,
    Reused,
}

impl Status {
    /// States with a live batch job worth polling.
    pub const IN_FLIGHT: [Status; 3] = [Status::Submitted, Status::Running, Status::Finishing];
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display,
)]
pub enum CondorStatus {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unset,
    #[serde(rename = "UNEXPLAINED")]
    #[strum(serialize = "UNEXPLAINED")]
    Unexplained,
    #[serde(rename = "IDLE")]
    #[strum(serialize = "IDLE")]
    Idle,
    #[serde(rename = "RUN")]
    #[strum(serialize = "RUN")]
    Run,
    #[serde(rename = "REMOVED")]
    #[strum(serialize = "REMOVED")]
    Removed,
    #[serde(rename = "DONE")]
    #[strum(serialize = "DONE")]
    Done,
    #[serde(rename = "HOLD")]
    #[strum(serialize = "HOLD")]
    Hold,
    #[serde(rename = "SUBMISSION ERROR")]
    #[strum(serialize = "SUBMISSION ERROR")]
    SubmissionError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user: String,
    pub time: i64,
    pub action: String,
}

/// The persisted document. Field names follow the collection schema; `_id`
/// is the opaque creation-timestamp id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridpackData {
    // Missing in creation payloads; assigned by the controller.
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub campaign: String,
    #[serde(default)]
    pub generator: String,
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub tune: String,
    #[serde(default)]
    pub events: i64,
    #[serde(default)]
    pub genproductions: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub condor_status: CondorStatus,
    #[serde(default)]
    pub condor_id: u64,
    // Output file name, set on ingest.
    #[serde(default)]
    pub archive: String,
    // Absolute remote path of the archive under the storage root.
    #[serde(default)]
    pub archive_absolute: String,
    // Id of the gridpack whose artifact was reused, "-1" when the artifact
    // was found without provenance, empty otherwise.
    #[serde(default)]
    pub gridpack_reused: String,
    #[serde(default)]
    pub dataset_name: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub prepid: String,
    #[serde(default)]
    pub store_into_subfolders: bool,
    // Absent when a reused artifact made the job request moot; the
    // accessors fall back to the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_memory: Option<u32>,
}

/// Generator family; decides which archive builder prepares the input
/// files. Resolved once, at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    MadGraph,
    Powheg,
}

impl GeneratorKind {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "MadGraph5_aMCatNLO" => Ok(GeneratorKind::MadGraph),
            "Powheg" => Ok(GeneratorKind::Powheg),
            other => bail!("could not make gridpack for generator {other}"),
        }
    }
}

pub struct Gridpack {
    pub data: GridpackData,
    kind: GeneratorKind,
}

impl Gridpack {
    /// Wrap a document, refusing unknown generators.
    pub fn make(data: GridpackData) -> anyhow::Result<Self> {
        let kind = GeneratorKind::from_name(&data.generator)?;
        Ok(Gridpack { data, kind })
    }

    pub fn kind(&self) -> GeneratorKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.data.id
    }

    pub fn status(&self) -> Status {
        self.data.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.data.status = status;
    }

    pub fn condor_status(&self) -> CondorStatus {
        self.data.condor_status
    }

    pub fn set_condor_status(&mut self, condor_status: CondorStatus) {
        self.data.condor_status = condor_status;
    }

    pub fn condor_id(&self) -> u64 {
        self.data.condor_id
    }

    pub fn set_condor_id(&mut self, condor_id: u64) {
        self.data.condor_id = condor_id;
    }

    pub fn cores(&self) -> u32 {
        self.data.job_cores.unwrap_or(DEFAULT_JOB_CORES)
    }

    pub fn memory(&self) -> u32 {
        self.data.job_memory.unwrap_or(DEFAULT_JOB_MEMORY)
    }

    /// A gridpack bound to an existing artifact runs no job of its own.
    pub fn clear_cores_memory(&mut self) {
        self.data.job_cores = None;
        self.data.job_memory = None;
    }

    pub fn set_prepid(&mut self, prepid: &str) {
        self.data.prepid = prepid.to_string();
    }

    /// Back to `new`, with the computed fields rebuilt from the current
    /// catalog coordinates.
    pub fn reset(&mut self, campaign: &CampaignCard) {
        self.set_status(Status::New);
        self.data.archive = String::new();
        self.data.archive_absolute = String::new();
        self.data.gridpack_reused = String::new();
        self.data.dataset_name = self.dataset_name(campaign);
        self.set_condor_status(CondorStatus::Unset);
        self.set_condor_id(0);
    }

    pub fn add_history_entry(&mut self, user: &str, action: &str) {
        self.data.history.push(HistoryEntry {
            user: user.to_string(),
            time: crate::now_seconds(),
            action: action.trim().to_string(),
        });
    }

    /// Sorted, distinct usernames of everyone who acted on this document.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .data
            .history
            .iter()
            .filter(|entry| entry.user != AUTOMATIC_USER)
            .map(|entry| entry.user.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Full dataset name: the tune and the collision energy spliced in
    /// before the final segment, `13.6 TeV` rendered as `13p6TeV`.
    pub fn dataset_name(&self, campaign: &CampaignCard) -> String {
        let energy = campaign.beam * 2.0 / 1000.0;
        let energy = format!("{energy:.2}");
        let energy = energy.trim_end_matches('0').trim_end_matches('.');
        let energy = energy.replace('.', "p");
        let tune_energy = format!("Tune{}_{}TeV", self.data.tune, energy);
        let mut parts: Vec<String> = self.data.dataset.split('_').map(str::to_string).collect();
        let index = parts.len().saturating_sub(1);
        parts.insert(index, tune_energy);
        let dataset_name = parts.join("_");
        debug!("dataset name for {self} is {dataset_name}");
        dataset_name
    }

    /// Validate user-supplied fields against the template repository. The
    /// returned message is surfaced to the caller as a 400.
    pub fn validate(&self, tree: &RepositoryTree) -> Result<(), String> {
        let genproductions = &self.data.genproductions;
        if !tree.branches.iter().any(|branch| branch == genproductions) {
            return Err(format!("Bad GEN productions branch \"{genproductions}\""));
        }

        let events = self.data.events;
        if events <= 0 {
            return Err(format!("Bad events \"{events}\""));
        }

        let campaign = &self.data.campaign;
        let Some(campaign_info) = tree.campaigns.get(campaign) else {
            return Err(format!("Bad campaign \"{campaign}\""));
        };

        let generator = &self.data.generator;
        if !campaign_info.generators.contains(generator) {
            return Err(format!("Bad generator \"{generator}\""));
        }

        let process = &self.data.process;
        let Some(processes) = tree.cards.get(generator) else {
            return Err(format!("Bad generator \"{generator}\""));
        };
        let Some(datasets) = processes.get(process) else {
            return Err(format!("Bad process \"{process}\""));
        };

        let dataset = &self.data.dataset;
        if !datasets.iter().any(|known| known == dataset) {
            return Err(format!("Bad dataset \"{dataset}\""));
        }

        let minimum_memory = self.cores() * MEMORY_FACTOR_MB;
        if self.memory() < minimum_memory {
            return Err(format!(
                "Memory set for Gridpack should be equal or greater than {minimum_memory} MB"
            ));
        }

        Ok(())
    }

    pub fn local_dir(&self, conf: &MachineConf) -> Utf8PathBuf {
        conf.local_dir(self.id())
    }

    pub fn job_files_path(&self, conf: &MachineConf) -> Utf8PathBuf {
        self.local_dir(conf).join("input_files")
    }

    /// `Cards/<generator>/<process>/<dataset>` in the template checkout.
    pub fn cards_path(&self, conf: &MachineConf) -> Utf8PathBuf {
        conf.gridpack_files_path
            .join("Cards")
            .join(&self.data.generator)
            .join(&self.data.process)
            .join(&self.data.dataset)
    }

    pub fn campaign_path(&self, conf: &MachineConf) -> Utf8PathBuf {
        conf.gridpack_files_path
            .join("Campaigns")
            .join(&self.data.campaign)
    }

    pub fn templates_path(&self, conf: &MachineConf) -> Utf8PathBuf {
        self.campaign_path(conf)
            .join(&self.data.generator)
            .join("Templates")
    }

    pub fn model_params_path(&self, conf: &MachineConf) -> Utf8PathBuf {
        self.campaign_path(conf)
            .join(&self.data.generator)
            .join("ModelParams")
    }

    /// Unique per-job namespace on the submission side.
    pub fn remote_dir(&self, conf: &MachineConf) -> String {
        format!("{}/{}", conf.remote_directory, self.id())
    }

    /// Storage folder down to `campaign`, `campaign/generator` or
    /// `campaign/generator/process`, depending on `include_until`.
    pub fn storage_folder(
        &self,
        conf: &MachineConf,
        include_until: usize,
    ) -> anyhow::Result<Utf8PathBuf> {
        let elements = [
            self.data.campaign.as_str(),
            self.data.generator.as_str(),
            self.data.process.as_str(),
        ];
        let subpath = elements[0..include_until.min(elements.len())].join("/");
        check_append_path(&conf.storage_root(), &subpath)
    }

    /// Where the produced archive is filed.
    pub fn remote_storage_path(&self, conf: &MachineConf) -> anyhow::Result<Utf8PathBuf> {
        if self.data.store_into_subfolders {
            self.storage_folder(conf, 3)
        } else {
            self.storage_folder(conf, 1)
        }
    }

    /// Absolute remote path of the produced archive. Derived from the
    /// archive name the first time it is asked for, then sticky.
    pub fn absolute_path(&mut self, conf: &MachineConf) -> anyhow::Result<String> {
        if self.data.archive_absolute.is_empty() && !self.data.archive.is_empty() {
            let storage = self.remote_storage_path(conf)?;
            self.data.archive_absolute =
                check_append_path(&storage, &self.data.archive)?.to_string();
        }
        Ok(self.data.archive_absolute.clone())
    }

    /// Priority bump for jobs that fit in the regular share.
    pub fn job_priority(&self) -> u32 {
        let cores = self.cores();
        if (1..=16).contains(&cores) {
            3
        } else {
            0
        }
    }

    /// The shell script the batch job executes: fetch the genproductions
    /// branch, stage the input files and run `gridpack_generation.sh`
    /// inside a Singularity container, then move the produced archive back
    /// to the job directory for transfer.
    pub fn render_script(&self, conf: &MachineConf) -> String {
        let gridpack_id = self.id();
        let repository = &conf.gen_repository;
        let generator = &self.data.generator;
        let dataset = &self.data.dataset;
        let genproductions = &self.data.genproductions;
        let gen_folder_marker = format!("{}-", repository.replace('/', "-"));

        let outside_singularity = vec![
            "#!/bin/sh".to_string(),
            "export HOME=$(pwd)".to_string(),
            "export ORG_PWD=$(pwd)".to_string(),
            format!("export NB_CORE={}", self.cores()),
            format!(
                "wget https://github.com/{repository}/tarball/{genproductions} -O genproductions.tar.gz"
            ),
        ];
        let inside_singularity = vec![
            "tar -xzf genproductions.tar.gz".to_string(),
            format!("GEN_FOLDER=$(ls -1 | grep {gen_folder_marker} | head -n 1)"),
            "echo $GEN_FOLDER".to_string(),
            "mv $GEN_FOLDER genproductions".to_string(),
            "cd genproductions".to_string(),
            "git init".to_string(),
            "cd ..".to_string(),
            format!("mv input_files.tar.gz genproductions/bin/{generator}/"),
            format!("cd genproductions/bin/{generator}"),
            "tar -xzf input_files.tar.gz".to_string(),
            "echo \"Input files:\"".to_string(),
            "ls -lha input_files/".to_string(),
            "echo \"Running gridpack_generation.sh\"".to_string(),
            format!("./gridpack_generation.sh {dataset} input_files pdmv"),
            "echo \".t*z archives after gridpack_generation.sh:\"".to_string(),
            "ls -lha *.t*z".to_string(),
            format!("mv *{dataset}*.t*z $ORG_PWD"),
        ];

        let mut script = outside_singularity;
        script.extend(wrap_into_singularity(
            &format!("GRIDPACK_SINGULARITY_{gridpack_id}.sh"),
            inside_singularity,
            &conf.container_os,
        ));
        script.join("\n")
    }

    /// The HTCondor job description.
    pub fn render_jds(&self, accounting_group: &str) -> String {
        let gridpack_id = self.id();
        let jds = [
            format!("executable              = GRIDPACK_{gridpack_id}.sh"),
            "transfer_input_files    = input_files.tar.gz".to_string(),
            "when_to_transfer_output = ON_EXIT_OR_EVICT".to_string(),
            "should_transfer_files   = yes".to_string(),
            "+JobFlavour             = \"nextweek\"".to_string(),
            "output                  = output.log".to_string(),
            "error                   = error.log".to_string(),
            "log                     = job.log".to_string(),
            format!("RequestCpus            = {}", self.cores()),
            format!("RequestMemory          = {}", self.memory()),
            format!("RequestDisk            = {}", 30 * DISK_FACTOR_KB_PER_GB),
            "requirements            = (OpSysAndVer =?= \"AlmaLinux9\")".to_string(),
            format!("+AccountingGroup        = \"{accounting_group}\""),
            format!("+JobPrio               = {}", self.job_priority()),
            "leave_in_queue          = JobStatus == 4 && (CompletionDate =?= UNDEFINED || ((CurrentTime - CompletionDate) < 7200))"
                .to_string(),
            "queue".to_string(),
        ];
        jds.join("\n")
    }
}

impl std::fmt::Display for Gridpack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Gridpack <{}> campaign={} dataset={} generator={} status={} condor={} ({})",
            self.data.id,
            self.data.campaign,
            self.data.dataset,
            self.data.generator,
            self.data.status,
            self.data.condor_status,
            self.data.condor_id,
        )
    }
}

/// Wrap job steps into a subscript executed through a CMSSW Singularity
/// container for the requested OS tag, binding the grid infrastructure
/// mounts and leaving the submission-side home out of the container.
fn wrap_into_singularity(script_name: &str, content: Vec<String>, desired_os: &str) -> Vec<String> {
    let container_path = "/cvmfs/unpacked.cern.ch/registry.hub.docker.com/cmssw";
    let wrapper_placeholder = "EndOfSingularityWrapper";

    let mut wrapped = vec![
        String::new(),
        format!("cat <<'{wrapper_placeholder}' > {script_name}"),
    ];
    wrapped.extend(content);
    wrapped.extend([
        String::new(),
        format!("# End of {script_name} file"),
        wrapper_placeholder.to_string(),
        String::new(),
        format!("# Make {script_name} file executable"),
        format!("chmod +x {script_name}"),
        String::new(),
        "# Check the proper tag for the architecture".to_string(),
        format!("if [ -e \"{container_path}/{desired_os}:amd64\" ]; then"),
        format!("  CONTAINER_NAME=\"{desired_os}:amd64\""),
        format!("elif [ -e \"{container_path}/{desired_os}:x86_64\" ]; then"),
        format!("  CONTAINER_NAME=\"{desired_os}:x86_64\""),
        "else".to_string(),
        format!("  echo \"Could not find amd64 or x86_64 for {desired_os}\""),
        "  exit 1".to_string(),
        "fi".to_string(),
        String::new(),
        "# Running into a singularity container".to_string(),
        "export SINGULARITY_CACHEDIR=\"/tmp/$(whoami)/singularity\"".to_string(),
        format!(
            "singularity run -B /afs -B /cvmfs -B /etc/grid-security -B /etc/pki/ca-trust \
             --no-home {container_path}/$CONTAINER_NAME $(echo $(pwd)/{script_name})"
        ),
        String::new(),
    ]);
    wrapped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_data(id: &str) -> GridpackData {
        GridpackData {
            id: id.to_string(),
            last_update: 0,
            campaign: "C1".to_string(),
            generator: "MadGraph5_aMCatNLO".to_string(),
            process: "P".to_string(),
            dataset: "D_NLO".to_string(),
            tune: "CP5".to_string(),
            events: 1000,
            genproductions: "main".to_string(),
            status: Status::New,
            condor_status: CondorStatus::Unset,
            condor_id: 0,
            archive: String::new(),
            archive_absolute: String::new(),
            gridpack_reused: String::new(),
            dataset_name: String::new(),
            history: Vec::new(),
            prepid: String::new(),
            store_into_subfolders: false,
            job_cores: Some(8),
            job_memory: Some(16_000),
        }
    }

    fn campaign_with_beam(beam: f64) -> CampaignCard {
        CampaignCard {
            beam,
            ..CampaignCard::default()
        }
    }

    fn catalog() -> RepositoryTree {
        let mut tree = RepositoryTree {
            branches: vec!["main".to_string()],
            tunes: vec!["CP5".to_string()],
            ..RepositoryTree::default()
        };
        tree.campaigns.insert(
            "C1".to_string(),
            crate::repository::CampaignInfo {
                generators: vec!["MadGraph5_aMCatNLO".to_string()],
                tune: "CP5".to_string(),
            },
        );
        tree.cards
            .entry("MadGraph5_aMCatNLO".to_string())
            .or_default()
            .insert("P".to_string(), vec!["D_NLO".to_string()]);
        tree
    }

    #[test]
    fn validation_checks_catalog_coordinates_and_resources() {
        let tree = catalog();
        assert!(Gridpack::make(test_data("1")).unwrap().validate(&tree).is_ok());

        let mut data = test_data("1");
        data.events = 0;
        let error = Gridpack::make(data).unwrap().validate(&tree).unwrap_err();
        assert!(error.contains("events"));

        let mut data = test_data("1");
        data.events = -100;
        assert!(Gridpack::make(data).unwrap().validate(&tree).is_err());

        let mut data = test_data("1");
        data.job_memory = Some(7_999);
        let error = Gridpack::make(data).unwrap().validate(&tree).unwrap_err();
        assert!(error.contains("8000 MB"));

        let mut data = test_data("1");
        data.genproductions = "no_such_branch".to_string();
        assert!(Gridpack::make(data).unwrap().validate(&tree).is_err());

        let mut data = test_data("1");
        data.campaign = "C2".to_string();
        assert!(Gridpack::make(data).unwrap().validate(&tree).is_err());

        let mut data = test_data("1");
        data.dataset = "D_UNKNOWN".to_string();
        assert!(Gridpack::make(data).unwrap().validate(&tree).is_err());
    }

    #[test]
    fn unknown_generator_is_refused() {
        let mut data = test_data("1");
        data.generator = "Herwig".to_string();
        assert!(Gridpack::make(data).is_err());
    }

    #[test]
    fn dataset_name_splices_tune_and_energy() {
        let gridpack = Gridpack::make(test_data("1")).unwrap();
        assert_eq!(
            gridpack.dataset_name(&campaign_with_beam(6500.0)),
            "D_TuneCP5_13TeV_NLO"
        );
        assert_eq!(
            gridpack.dataset_name(&campaign_with_beam(6800.0)),
            "D_TuneCP5_13p6TeV_NLO"
        );
    }

    #[test]
    fn reset_clears_job_state_and_recomputes_name() {
        let mut gridpack = Gridpack::make(test_data("1")).unwrap();
        gridpack.set_status(Status::Running);
        gridpack.set_condor_id(42);
        gridpack.set_condor_status(CondorStatus::Run);
        gridpack.data.archive = "old.tar.xz".to_string();
        gridpack.data.archive_absolute = "/eos/old.tar.xz".to_string();
        gridpack.data.gridpack_reused = "123".to_string();

        gridpack.reset(&campaign_with_beam(6500.0));

        assert_eq!(gridpack.status(), Status::New);
        assert_eq!(gridpack.condor_id(), 0);
        assert_eq!(gridpack.condor_status(), CondorStatus::Unset);
        assert!(gridpack.data.archive.is_empty());
        assert!(gridpack.data.archive_absolute.is_empty());
        assert!(gridpack.data.gridpack_reused.is_empty());
        assert_eq!(gridpack.data.dataset_name, "D_TuneCP5_13TeV_NLO");
    }

    #[test]
    fn storage_path_honors_subfolder_flag() {
        let conf = MachineConf::dummy();
        let mut data = test_data("1");
        data.store_into_subfolders = true;
        let gridpack = Gridpack::make(data).unwrap();
        assert_eq!(
            gridpack.remote_storage_path(&conf).unwrap(),
            Utf8PathBuf::from("/eos/dev/gridpacks/C1/MadGraph5_aMCatNLO/P")
        );

        let gridpack = Gridpack::make(test_data("1")).unwrap();
        assert_eq!(
            gridpack.remote_storage_path(&conf).unwrap(),
            Utf8PathBuf::from("/eos/dev/gridpacks/C1")
        );
    }

    #[test]
    fn absolute_path_is_storage_join_and_sticky() {
        let conf = MachineConf::dummy();
        let mut gridpack = Gridpack::make(test_data("1")).unwrap();
        assert_eq!(gridpack.absolute_path(&conf).unwrap(), "");

        gridpack.data.archive = "D_NLO_TuneCP5_13TeV.tar.xz".to_string();
        assert_eq!(
            gridpack.absolute_path(&conf).unwrap(),
            "/eos/dev/gridpacks/C1/D_NLO_TuneCP5_13TeV.tar.xz"
        );

        // Sticky once computed, even if the flag changes afterwards.
        gridpack.data.store_into_subfolders = true;
        assert_eq!(
            gridpack.absolute_path(&conf).unwrap(),
            "/eos/dev/gridpacks/C1/D_NLO_TuneCP5_13TeV.tar.xz"
        );
    }

    #[test]
    fn history_users_are_distinct_and_sorted() {
        let mut gridpack = Gridpack::make(test_data("1")).unwrap();
        gridpack.add_history_entry("walter", "created");
        gridpack.add_history_entry(AUTOMATIC_USER, "submitted");
        gridpack.add_history_entry("ana", "reset");
        gridpack.add_history_entry("walter", "approve");
        assert_eq!(gridpack.users(), vec!["ana", "walter"]);
    }

    #[test]
    fn jds_requests_resources_and_retention() {
        let gridpack = Gridpack::make(test_data("1")).unwrap();
        let jds = gridpack.render_jds("group_u_CMS.u_zh.priority");
        assert!(jds.contains("RequestCpus            = 8"));
        assert!(jds.contains("RequestMemory          = 16000"));
        assert!(jds.contains("RequestDisk            = 30000000"));
        assert!(jds.contains("+AccountingGroup        = \"group_u_CMS.u_zh.priority\""));
        assert!(jds.contains("+JobPrio               = 3"));
        assert!(jds.contains("(OpSysAndVer =?= \"AlmaLinux9\")"));
        assert!(jds.contains("leave_in_queue"));
        assert!(jds.ends_with("queue"));
    }

    #[test]
    fn job_priority_drops_for_wide_jobs() {
        let mut data = test_data("1");
        data.job_cores = Some(32);
        data.job_memory = Some(64_000);
        let gridpack = Gridpack::make(data).unwrap();
        assert_eq!(gridpack.job_priority(), 0);
    }

    #[test]
    fn script_stages_inputs_and_wraps_in_singularity() {
        let conf = MachineConf::dummy();
        let gridpack = Gridpack::make(test_data("1700000000001")).unwrap();
        let script = gridpack.render_script(&conf);
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script
            .contains("wget https://github.com/cms-sw/genproductions/tarball/main"));
        assert!(script.contains("mv input_files.tar.gz genproductions/bin/MadGraph5_aMCatNLO/"));
        assert!(script.contains("./gridpack_generation.sh D_NLO input_files pdmv"));
        assert!(script.contains("cat <<'EndOfSingularityWrapper' > GRIDPACK_SINGULARITY_1700000000001.sh"));
        assert!(script.contains("-B /afs -B /cvmfs -B /etc/grid-security"));
        assert!(script.contains("el9:amd64"));
        assert!(script.contains("mv *D_NLO*.t*z $ORG_PWD"));
    }

    #[test]
    fn status_round_trips_through_serde() {
        let status: Status = serde_json::from_str("\"submitted\"").unwrap();
        assert_eq!(status, Status::Submitted);
        assert_eq!(serde_json::to_string(&Status::Reused).unwrap(), "\"reused\"");

        let condor: CondorStatus = serde_json::from_str("\"SUBMISSION ERROR\"").unwrap();
        assert_eq!(condor, CondorStatus::SubmissionError);
        assert_eq!(serde_json::to_string(&CondorStatus::Unset).unwrap(), "\"\"");
        assert_eq!(CondorStatus::Run.to_string(), "RUN");
    }
}
