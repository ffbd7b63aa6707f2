//! MadGraph5_aMCatNLO input files: the dataset's own cards, a run card
//! customized from the campaign template, and the model-parameter
//! customize card.

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
    copy_default_cards(gridpack, conf)?;

    let job_files = gridpack.job_files_path(conf);
    let dataset_name = &gridpack.data.dataset;

    let run_card = run_card_contents(gridpack, conf, dataset, campaign)?;
    let run_card_path = job_files.join(format!("{dataset_name}_run_card.dat"));
    debug!("writing {run_card_path}");
    std::fs::write(&run_card_path, run_card).with_context(|| format!("writing {run_card_path}"))?;

    if let Some(customize_card) = customize_card_contents(gridpack, conf, dataset, campaign)? {
        let customize_card_path = job_files.join(format!("{dataset_name}_customizecards.dat"));
        debug!("writing {customize_card_path}");
        std::fs::write(&customize_card_path, customize_card)
            .with_context(|| format!("writing {customize_card_path}"))?;
    }

    Ok(())
}

/// Copy `*.dat` cards and any `*_cuts.f` from the dataset card directory.
fn copy_default_cards(gridpack: &Gridpack, conf: &MachineConf) -> anyhow::Result<()> {
    let cards_path = gridpack.cards_path(conf);
    let job_files = gridpack.job_files_path(conf);
    debug!("copying cards from {cards_path} to {job_files}");
    let entries =
        std::fs::read_dir(&cards_path).with_context(|| format!("listing {cards_path}"))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".dat") || name.ends_with("_cuts.f") {
            std::fs::copy(entry.path(), job_files.join(&name))
                .with_context(|| format!("copying {name}"))?;
        }
    }
    Ok(())
}

/// The run card, built from the campaign template named by the dataset
/// descriptor.
pub fn run_card_contents(
    gridpack: &Gridpack,
    conf: &MachineConf,
    dataset: &DatasetCard,
    campaign: &CampaignCard,
) -> anyhow::Result<String> {
    if dataset.template_name.is_empty() {
        bail!(
            "no run card template set for dataset {}",
            gridpack.data.dataset
        );
    }
    let template_path = gridpack.templates_path(conf).join(&dataset.template_name);
    debug!("reading {template_path}");
    let source = std::fs::read_to_string(&template_path)
        .with_context(|| format!("reading {template_path}"))?;
    Ok(customize_contents(
        &source,
        &dataset.user,
        &card_replacements(dataset, campaign),
    ))
}

/// The customize card, from the model-parameter scheme; `None` when the
/// dataset does not name one.
pub fn customize_card_contents(
    gridpack: &Gridpack,
    conf: &MachineConf,
    dataset: &DatasetCard,
    campaign: &CampaignCard,
) -> anyhow::Result<Option<String>> {
    if dataset.model_params.is_empty() {
        return Ok(None);
    }
    let scheme_path = gridpack.model_params_path(conf).join(&dataset.model_params);
    debug!("reading {scheme_path}");
    let source =
        std::fs::read_to_string(&scheme_path).with_context(|| format!("reading {scheme_path}"))?;
    Ok(Some(customize_contents(
        &source,
        &dataset.user,
        &card_replacements(dataset, campaign),
    )))
}
