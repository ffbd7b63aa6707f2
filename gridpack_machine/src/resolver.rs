//! Decides whether a pending request can consume an existing artifact
//! under the storage root instead of running a new batch job, and links
//! the lineage back to the producing document.

use anyhow::{anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use remote_executor::RemoteSession;
use tracing::debug;

use crate::database::DocumentStore;
use crate::gridpack::Gridpack;
use crate::paths::check_append_path;
use crate::repository::DatasetCard;
use crate::MachineConf;

/// `gridpack_submit` is a tri-state: absent means submit, `false` means
/// reuse, anything else means submit.
pub fn reuse_requested(dataset: &DatasetCard) -> bool {
    dataset.gridpack_submit == Some(false)
}

/// Target of the reuse probe: `gridpack_path` (process plus file-name
/// pattern) appended under `<storage root>/<campaign>/<generator>`. A
/// missing or absolute `gridpack_path` disqualifies the request.
pub fn reusable_artifact_path(
    gridpack: &Gridpack,
    conf: &MachineConf,
    dataset: &DatasetCard,
) -> anyhow::Result<Utf8PathBuf> {
    if !reuse_requested(dataset) {
        bail!("it is not intended to reuse a gridpack");
    }
    let process_and_file = dataset
        .gridpack_path
        .as_deref()
        .filter(|path| !path.is_empty())
        .ok_or_else(|| anyhow!("gridpack path to reuse was not provided"))?;
    let root = gridpack.storage_folder(conf, 2)?;
    check_append_path(&root, process_and_file)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseCandidate {
    pub file_name: String,
    pub absolute_path: Utf8PathBuf,
}

/// List the artifact's folder and pick the newest file matching the
/// pattern derived from the path's final component.
pub async fn probe(
    session: &mut dyn RemoteSession,
    artifact_path: &Utf8Path,
) -> anyhow::Result<Option<ReuseCandidate>> {
    let folder = artifact_path
        .parent()
        .ok_or_else(|| anyhow!("artifact path {artifact_path} has no parent folder"))?;
    let name = artifact_path
        .file_name()
        .ok_or_else(|| anyhow!("artifact path {artifact_path} has no file component"))?;
    let pattern = Regex::new(&format!("^{name}"))?;

    let output = session.execute(&[&scan_command(folder)]).await?;
    if output.exit_code != 0 || output.stderr.contains("ls: cannot") {
        debug!("unable to list {folder}: {}", output.stderr);
        return Ok(None);
    }

    for (_mtime, file_name) in parse_listing(&output.stdout) {
        if pattern.is_match(&file_name) {
            let absolute_path = folder.join(&file_name);
            return Ok(Some(ReuseCandidate {
                file_name,
                absolute_path,
            }));
        }
    }
    Ok(None)
}

/// `ls` with epoch mtimes, keeping only plain files, reduced to
/// `mtime name` pairs.
fn scan_command(folder: &Utf8Path) -> String {
    format!(
        "ls -l --time-style=+%s '{folder}' | grep '^[^d|p|total]' | awk '{{print $6,$7}}'"
    )
}

/// Parse `mtime name` rows, newest first.
fn parse_listing(stdout: &str) -> Vec<(i64, String)> {
    let mut files: Vec<(i64, String)> = stdout
        .lines()
        .filter_map(|line| {
            let mut columns = line.split(' ');
            let mtime = columns.next()?.parse::<i64>().ok()?;
            let name = columns.next()?;
            (!name.is_empty()).then(|| (mtime, name.to_string()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files
}

/// Find the gridpack whose job produced `file_name`; the new document
/// links to it, or records `-1` when the artifact has no provenance.
pub async fn find_lineage(
    store: &dyn DocumentStore,
    gridpack: &Gridpack,
    file_name: &str,
) -> anyhow::Result<String> {
    let producers = store
        .by_archive(
            file_name,
            &gridpack.data.campaign,
            &gridpack.data.generator,
            &gridpack.data.process,
        )
        .await?;
    Ok(match producers.first() {
        Some(producer) => producer.id.clone(),
        None => "-1".to_string(),
    })
}

/// Artifact path used for fragments and downstream requests; a document
/// without an archive of its own resolves through the gridpack it reused.
pub async fn effective_artifact(
    store: &dyn DocumentStore,
    conf: &MachineConf,
    gridpack: &mut Gridpack,
) -> anyhow::Result<(String, String)> {
    let own = gridpack.absolute_path(conf)?;
    if !own.is_empty() {
        return Ok((own, gridpack.id().to_string()));
    }

    let parent_id = gridpack.data.gridpack_reused.clone();
    if parent_id.is_empty() || parent_id == "-1" {
        bail!("gridpack {} has no produced archive", gridpack.id());
    }
    let parent = store
        .get(&parent_id)
        .await?
        .ok_or_else(|| anyhow!("reused gridpack {parent_id} is not in the database"))?;
    let mut parent = Gridpack::make(parent)?;
    let path = parent.absolute_path(conf)?;
    if path.is_empty() {
        bail!("reused gridpack {parent_id} has no archive either");
    }
    Ok((path, parent_id))
}
