//! HTCondor queue helpers: the batch scheduler is reachable only through
//! commands run over SSH on the submission host.

use std::collections::HashMap;

use anyhow::bail;
use remote_executor::RemoteSession;
use tracing::debug;

use crate::gridpack::CondorStatus;

/// Gridpack jobs are recognized in the queue by their executable name.
pub const GRIDPACK_JOB_MARKER: &str = "GRIDPACK_";

const QUEUE_QUERY: &str = "condor_q -af:h ClusterId JobStatus Cmd";
const QUEUE_HEADER: &str = "ClusterId JobStatus Cmd";

/// Numeric `JobStatus` codes as reported by `condor_q`.
pub fn status_from_code(code: &str) -> CondorStatus {
    match code {
        "0" => CondorStatus::Unexplained,
        "1" => CondorStatus::Idle,
        "2" => CondorStatus::Run,
        "3" => CondorStatus::Removed,
        "4" => CondorStatus::Done,
        "5" => CondorStatus::Hold,
        "6" => CondorStatus::SubmissionError,
        _ => CondorStatus::Removed,
    }
}

/// Fetch `(cluster id -> status)` for every gridpack job in the queue.
pub async fn jobs_in_condor(
    session: &mut dyn RemoteSession,
) -> anyhow::Result<HashMap<u64, CondorStatus>> {
    let output = session.execute(&[QUEUE_QUERY]).await?;
    if output.exit_code != 0 {
        bail!(
            "HTCondor status check returned {}:\n{}\n{}",
            output.exit_code,
            output.stdout,
            output.stderr
        );
    }
    let jobs = parse_queue_table(&output.stdout)?;
    debug!("job status in HTCondor: {jobs:?}");
    Ok(jobs)
}

fn parse_queue_table(stdout: &str) -> anyhow::Result<HashMap<u64, CondorStatus>> {
    let mut lines = stdout.lines();
    let header = lines.next().unwrap_or_default();
    if !header.contains(QUEUE_HEADER) {
        bail!("HTCondor is not working");
    }

    let mut jobs = HashMap::new();
    for line in lines {
        if !line.contains(GRIDPACK_JOB_MARKER) {
            continue;
        }
        let mut columns = line.split_whitespace();
        let (Some(cluster_id), Some(code)) = (columns.next(), columns.next()) else {
            continue;
        };
        let Ok(cluster_id) = cluster_id.parse::<u64>() else {
            continue;
        };
        jobs.insert(cluster_id, status_from_code(code));
    }
    Ok(jobs)
}

/// Stream the stdout of a running job into a public log file on the
/// submission side, so requesters can follow the generation live.
pub async fn stream_job_log(
    session: &mut dyn RemoteSession,
    condor_id: u64,
    log_path: &str,
) -> anyhow::Result<()> {
    let command = format!("condor_ssh_to_job {condor_id} 'cat _condor_stdout' > {log_path}");
    let output = session.execute(&[&command]).await?;
    if output.exit_code != 0 {
        bail!(
            "streaming job {condor_id} output returned {}:\n{}",
            output.exit_code,
            output.stderr
        );
    }
    Ok(())
}
