use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use remote_executor::SshCredentials;

use crate::controller::Controller;
use crate::database::DocumentStore;
use crate::repository::TemplateRepository;
use crate::scheduler::Scheduler;

pub mod condor;
pub mod controller;
pub mod database;
pub mod generator;
pub mod gridpack;
pub mod http;
pub mod notifier;
pub mod paths;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod user;

/// Gridpacks produced in the production profile land in the GEN group
/// folder on /eos, which is synchronized to /cvmfs.
pub const PRODUCTION_STORAGE_ROOT: &str =
    "/eos/cms/store/group/phys_generator/cvmfs/gridpacks/PdmV/";

pub mod defaults {
    pub const DEFAULT_TICK_INTERVAL: u64 = 600;
    pub const DEFAULT_REPOSITORY_UPDATE_INTERVAL: u64 = 1800;
    pub const DEFAULT_REPOSITORY_TICK_PAUSE: u64 = 60;
    pub const DEFAULT_GEN_REPOSITORY: &str = "cms-sw/genproductions";
    pub const DEFAULT_GRIDPACK_FILES_REPOSITORY: &str =
        "https://github.com/cms-PdmV/GridpackFiles.git";
    pub const DEFAULT_CONTAINER_OS: &str = "el9";
    pub const DEFAULT_SMTP_HOST: &str = "smtp.cern.ch";
    pub const DEFAULT_SMTP_PORT: u16 = 587;
    pub const DEFAULT_MONGO_PORT: u16 = 27017;
    pub const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
    pub const DEFAULT_HTTP_PORT: u16 = 8000;
}

#[derive(Debug, Clone)]
pub struct MachineConf {
    // Working directory, relative to the current working directory of the
    // process. Normally '.'; unit tests point it at scratch directories so
    // parallel tests do not clash over gridpacks/<id>.
    pub workdir: Utf8PathBuf,
    pub tick_interval: Duration,
    pub repository_update_interval: Duration,
    pub repository_tick_pause: Duration,
    pub service_url: String,
    pub submission_host: String,
    pub ssh_credentials: SshCredentials,
    pub remote_directory: String,
    pub tickets_directory: String,
    pub gen_repository: String,
    pub authorized: HashSet<String>,
    pub gridpack_directory: Utf8PathBuf,
    pub gridpack_files_path: Utf8PathBuf,
    pub gridpack_files_repository: String,
    pub public_stream_folder: String,
    pub request_script_path: Utf8PathBuf,
    pub container_os: String,
    pub use_htcondor_cms_caf: bool,
    pub production: bool,
    pub email_auth: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mongo_host: String,
    pub mongo_port: u16,
    pub mongo_user: String,
    pub mongo_password: String,
    pub http_host: String,
    pub http_port: u16,
    pub debug: bool,
}

impl MachineConf {
    /// Read the whole configuration from the environment. Every value
    /// without a default is mandatory; missing names are reported together
    /// so the operator can fix them in one pass.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut missing: Vec<&'static str> = Vec::new();
        let mut required = |name: &'static str| -> String {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => value,
                _ => {
                    missing.push(name);
                    String::new()
                }
            }
        };
        let optional = |name: &str, default: &str| -> String {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let flag = |name: &str| -> bool {
            std::env::var(name).ok().filter(|v| !v.is_empty()).is_some()
        };

        let conf = MachineConf {
            workdir: Utf8PathBuf::from("."),
            tick_interval: Duration::from_secs(
                optional(
                    "TICK_INTERVAL",
                    &defaults::DEFAULT_TICK_INTERVAL.to_string(),
                )
                .parse()?,
            ),
            repository_update_interval: Duration::from_secs(
                optional(
                    "REPOSITORY_UPDATE_INTERVAL",
                    &defaults::DEFAULT_REPOSITORY_UPDATE_INTERVAL.to_string(),
                )
                .parse()?,
            ),
            repository_tick_pause: Duration::from_secs(
                optional(
                    "REPOSITORY_TICK_PAUSE",
                    &defaults::DEFAULT_REPOSITORY_TICK_PAUSE.to_string(),
                )
                .parse()?,
            ),
            service_url: required("SERVICE_URL"),
            submission_host: required("SUBMISSION_HOST"),
            ssh_credentials: SshCredentials {
                username: required("SERVICE_ACCOUNT_USERNAME"),
                password: required("SERVICE_ACCOUNT_PASSWORD"),
            },
            remote_directory: required("REMOTE_DIRECTORY"),
            tickets_directory: required("TICKETS_DIRECTORY"),
            gen_repository: optional("GEN_REPOSITORY", defaults::DEFAULT_GEN_REPOSITORY),
            authorized: required("AUTHORIZED")
                .split(',')
                .map(|role| role.trim().to_lowercase())
                .filter(|role| !role.is_empty())
                .collect(),
            gridpack_directory: Utf8PathBuf::from(required("GRIDPACK_DIRECTORY")),
            gridpack_files_path: Utf8PathBuf::from(required("GRIDPACK_FILES_PATH")),
            gridpack_files_repository: optional(
                "GRIDPACK_FILES_REPOSITORY",
                defaults::DEFAULT_GRIDPACK_FILES_REPOSITORY,
            ),
            public_stream_folder: required("PUBLIC_STREAM_FOLDER"),
            request_script_path: Utf8PathBuf::from(required("REQUEST_SCRIPT_PATH")),
            container_os: optional("CONTAINER_OS", defaults::DEFAULT_CONTAINER_OS),
            use_htcondor_cms_caf: flag("USE_HTCONDOR_CMS_CAF"),
            production: flag("PRODUCTION"),
            email_auth: flag("EMAIL_AUTH"),
            smtp_host: optional("SMTP_HOST", defaults::DEFAULT_SMTP_HOST),
            smtp_port: optional("SMTP_PORT", &defaults::DEFAULT_SMTP_PORT.to_string()).parse()?,
            mongo_host: required("MONGO_DB_HOST"),
            mongo_port: optional("MONGO_DB_PORT", &defaults::DEFAULT_MONGO_PORT.to_string())
                .parse()?,
            mongo_user: optional("MONGO_DB_USER", ""),
            mongo_password: optional("MONGO_DB_PASSWORD", ""),
            http_host: optional("HOST", defaults::DEFAULT_HTTP_HOST),
            http_port: optional("PORT", &defaults::DEFAULT_HTTP_PORT.to_string()).parse()?,
            debug: flag("DEBUG"),
        };

        if !missing.is_empty() {
            anyhow::bail!(
                "environment variables required before running this application: {}",
                missing.join(", ")
            );
        }

        Ok(conf)
    }

    /// Filesystem prefix under which produced artifacts are archived.
    pub fn storage_root(&self) -> Utf8PathBuf {
        if self.production {
            Utf8PathBuf::from(PRODUCTION_STORAGE_ROOT)
        } else {
            self.gridpack_directory.clone()
        }
    }

    /// Local working directory owned by one gridpack.
    pub fn local_dir(&self, gridpack_id: &str) -> Utf8PathBuf {
        self.workdir.join("gridpacks").join(gridpack_id)
    }

    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        MachineConf {
            workdir: Utf8PathBuf::from("."),
            tick_interval: Duration::from_secs(defaults::DEFAULT_TICK_INTERVAL),
            repository_update_interval: Duration::from_secs(
                defaults::DEFAULT_REPOSITORY_UPDATE_INTERVAL,
            ),
            repository_tick_pause: Duration::from_secs(defaults::DEFAULT_REPOSITORY_TICK_PAUSE),
            service_url: "https://gridpacks.example.org/gridpack".to_string(),
            submission_host: "submit.example.org".to_string(),
            ssh_credentials: SshCredentials {
                username: "svcaccount".to_string(),
                password: "secret".to_string(),
            },
            remote_directory: "/afs/example.org/work/gridpacks".to_string(),
            tickets_directory: "/afs/example.org/work/tickets".to_string(),
            gen_repository: defaults::DEFAULT_GEN_REPOSITORY.to_string(),
            authorized: ["gridpack-operators".to_string()].into_iter().collect(),
            gridpack_directory: Utf8PathBuf::from("/eos/dev/gridpacks"),
            gridpack_files_path: Utf8PathBuf::from("/srv/GridpackFiles"),
            gridpack_files_repository: defaults::DEFAULT_GRIDPACK_FILES_REPOSITORY.to_string(),
            public_stream_folder: "/eos/dev/gridpack-logs".to_string(),
            request_script_path: Utf8PathBuf::from("mcm_gridpack.py"),
            container_os: defaults::DEFAULT_CONTAINER_OS.to_string(),
            use_htcondor_cms_caf: false,
            production: false,
            email_auth: false,
            smtp_host: defaults::DEFAULT_SMTP_HOST.to_string(),
            smtp_port: defaults::DEFAULT_SMTP_PORT,
            mongo_host: "localhost".to_string(),
            mongo_port: defaults::DEFAULT_MONGO_PORT,
            mongo_user: String::new(),
            mongo_password: String::new(),
            http_host: defaults::DEFAULT_HTTP_HOST.to_string(),
            http_port: defaults::DEFAULT_HTTP_PORT,
            debug: false,
        }
    }
}

/// Everything the HTTP layer needs, wired once in the binary. Handlers
/// receive a reference to this instead of reaching for process-wide
/// singletons.
pub struct Service {
    pub conf: Arc<MachineConf>,
    pub controller: Arc<Controller>,
    pub repository: Arc<TemplateRepository>,
    pub store: Arc<dyn DocumentStore>,
    pub scheduler: Scheduler,
}

/// Seconds since the Unix epoch.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Milliseconds since the Unix epoch; gridpack ids are this, stringified.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
