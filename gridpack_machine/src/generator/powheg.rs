//! Powheg input files: a single `powheg.input` steering file assembled
//! from the process template plus the model parameters, and a `process.dat`
//! carrying the process name for `gridpack_generation.sh`.

use anyhow::{bail, Context};
use tracing::debug;

use crate::generator::{card_replacements, customize_contents};
use crate::gridpack::Gridpack;
use crate::repository::{CampaignCard, DatasetCard};
use crate::MachineConf;

pub fn prepare_input_files(
    gridpack: &Gridpack,
    conf: &MachineConf,
    dataset: &DatasetCard,
    campaign: &CampaignCard,
) -> anyhow::Result<()> {
    let job_files = gridpack.job_files_path(conf);

    let steering = steering_contents(gridpack, conf, dataset, campaign)?;
    let steering_path = job_files.join("powheg.input");
    debug!("writing {steering_path}");
    std::fs::write(&steering_path, steering).with_context(|| format!("writing {steering_path}"))?;

    let process_path = job_files.join("process.dat");
    debug!("writing {process_path}");
    std::fs::write(&process_path, process_name(dataset)?)
        .with_context(|| format!("writing {process_path}"))?;

    Ok(())
}

/// `powheg.input`: the customized process template followed by the
/// customized model parameters; the user additions close the file.
pub fn steering_contents(
    gridpack: &Gridpack,
    conf: &MachineConf,
    dataset: &DatasetCard,
    campaign: &CampaignCard,
) -> anyhow::Result<String> {
    if dataset.template_name.is_empty() {
        bail!(
            "no process template set for dataset {}",
            gridpack.data.dataset
        );
    }
    let replacements = card_replacements(dataset, campaign);

    let template_path = gridpack.templates_path(conf).join(&dataset.template_name);
    debug!("reading {template_path}");
    let template = std::fs::read_to_string(&template_path)
        .with_context(|| format!("reading {template_path}"))?;
    let template = customize_contents(&template, &[], &replacements);

    let model_params_path = gridpack.model_params_path(conf).join(&dataset.model_params);
    debug!("reading {model_params_path}");
    let model_params = std::fs::read_to_string(&model_params_path)
        .with_context(|| format!("reading {model_params_path}"))?;
    let model_params = customize_contents(&model_params, &dataset.user, &replacements);

    // A blank line separates the template section from the model
    // parameters.
    Ok(format!("{template}\n{model_params}"))
}

/// The process name is the stem of the template file name, cut at the
/// first dot.
pub fn process_name(dataset: &DatasetCard) -> anyhow::Result<String> {
    match dataset.template_name.splitn(2, '.').next() {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => bail!("cannot derive a process name from template {:?}", dataset.template_name),
    }
}
