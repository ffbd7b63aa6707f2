//! Generator-specific input file assembly. Dispatch is by the `generator`
//! field on the document; each variant writes its card set under
//! `<local>/input_files/` and the whole directory is gzipped for transfer
//! to the batch job.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::Utf8Path;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::gridpack::{GeneratorKind, Gridpack};
use crate::repository::{CampaignCard, DatasetCard};
use crate::MachineConf;

pub mod fragment;
pub mod madgraph;
pub mod powheg;

const USER_SETTINGS_BANNER: &str = "# User settings";

/// Write the generator-specific input files and produce
/// `input_files.tar.gz` next to them.
pub fn prepare_job_archive(
    gridpack: &Gridpack,
    conf: &MachineConf,
    dataset: &DatasetCard,
    campaign: &CampaignCard,
) -> anyhow::Result<()> {
    let job_files = gridpack.job_files_path(conf);
    std::fs::create_dir_all(&job_files).with_context(|| format!("creating {job_files}"))?;

    match gridpack.kind() {
        GeneratorKind::MadGraph => madgraph::prepare_input_files(gridpack, conf, dataset, campaign)?,
        GeneratorKind::Powheg => powheg::prepare_input_files(gridpack, conf, dataset, campaign)?,
    }

    compress_job_files(&gridpack.local_dir(conf))
}

fn compress_job_files(local_dir: &Utf8Path) -> anyhow::Result<()> {
    let archive_path = local_dir.join("input_files.tar.gz");
    let tar_gz =
        std::fs::File::create(&archive_path).with_context(|| format!("creating {archive_path}"))?;
    let encoder = GzEncoder::new(tar_gz, Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive
        .append_dir_all("input_files", local_dir.join("input_files"))
        .context("archiving input_files")?;
    archive
        .into_inner()
        .context("finishing tar stream")?
        .finish()
        .context("finishing gzip stream")?;
    Ok(())
}

/// Customize a card: append the user additions under the banner, run the
/// variable substitution, end with exactly one newline.
pub fn customize_contents(
    source: &str,
    user_additions: &[String],
    replacements: &BTreeMap<String, Value>,
) -> String {
    let mut contents = source.trim().to_string();
    if !user_additions.is_empty() {
        contents.push_str("\n\n");
        contents.push_str(USER_SETTINGS_BANNER);
        contents.push('\n');
        for user_line in user_additions {
            contents.push_str(user_line);
            contents.push('\n');
        }
    }

    let contents = substitute_variables(&contents, replacements);
    format!("{}\n", contents.trim())
}

/// Replace every `$<name>` occurrence with its value. List-valued bindings
/// expand across lines, indented to the column where the placeholder sits,
/// joined with `,`.
pub fn substitute_variables(text: &str, replacements: &BTreeMap<String, Value>) -> String {
    let mut result = text.to_string();
    for (name, value) in replacements {
        let placeholder = format!("${name}");
        let rendered = match value {
            Value::Array(items) => {
                let indentation = " ".repeat(indentation_of(&placeholder, &result));
                let lines: Vec<String> = items
                    .iter()
                    .map(|item| format!("{indentation}{}", render_value(item)))
                    .collect();
                lines.join(",\n").trim().to_string()
            }
            other => render_value(other),
        };
        result = result.replace(&placeholder, &rendered);
    }
    result
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Column of the first line containing `phrase`.
fn indentation_of(phrase: &str, text: &str) -> usize {
    text.lines()
        .find(|line| line.contains(phrase))
        .map(|line| line.len() - line.trim_start().len())
        .unwrap_or(0)
}

/// Beam energies come from JSON numbers; render them the way they look in
/// a card file (no trailing `.0` for integral values).
pub(crate) fn beam_value(beam: f64) -> Value {
    if beam.fract() == 0.0 {
        Value::String(format!("{}", beam as i64))
    } else {
        Value::String(beam.to_string())
    }
}

/// Replacement set for run and model-parameter cards: dataset variables,
/// overridden by campaign variables, plus both beam energies.
pub(crate) fn card_replacements(
    dataset: &DatasetCard,
    campaign: &CampaignCard,
) -> BTreeMap<String, Value> {
    let mut replacements = dataset.template_vars.clone();
    replacements.extend(campaign.template_vars.clone());
    replacements.insert("ebeam1".to_string(), beam_value(campaign.beam));
    replacements.insert("ebeam2".to_string(), beam_value(campaign.beam));
    replacements
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replacements(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn user_additions_land_under_the_banner() {
        let customized = customize_contents(
            "nevents = 5000\n",
            &["set param_card mass 6 172.5".to_string()],
            &BTreeMap::new(),
        );
        assert_eq!(
            customized,
            "nevents = 5000\n\n# User settings\nset param_card mass 6 172.5\n"
        );
    }

    #[test]
    fn no_banner_without_additions() {
        let customized = customize_contents("nevents = 5000", &[], &BTreeMap::new());
        assert_eq!(customized, "nevents = 5000\n");
    }

    #[test]
    fn scalar_substitution() {
        let customized = customize_contents(
            "ebeam1 = $ebeam1\nnevents = $nevents",
            &[],
            &replacements(&[("ebeam1", json!("6500")), ("nevents", json!(5000))]),
        );
        assert_eq!(customized, "ebeam1 = 6500\nnevents = 5000\n");
    }

    #[test]
    fn list_substitution_expands_at_placeholder_column() {
        let substituted = substitute_variables(
            "processParameters = cms.vstring(\n        $processParameters\n    )",
            &replacements(&[("processParameters", json!(["'a = 1'", "'b = 2'"]))]),
        );
        assert_eq!(
            substituted,
            "processParameters = cms.vstring(\n        'a = 1',\n        'b = 2'\n    )"
        );
    }

    #[test]
    fn result_always_ends_with_single_newline() {
        let customized = customize_contents("line\n\n\n", &[], &BTreeMap::new());
        assert_eq!(customized, "line\n");
    }

    #[test]
    fn beam_rendering_drops_integral_fraction() {
        assert_eq!(beam_value(6500.0), json!("6500"));
        assert_eq!(beam_value(6512.5), json!("6512.5"));
    }

    #[test]
    fn campaign_variables_override_dataset_variables() {
        let mut dataset = DatasetCard::default();
        dataset
            .template_vars
            .insert("nevents".to_string(), json!("1000"));
        let mut campaign = CampaignCard::default();
        campaign.beam = 6500.0;
        campaign
            .template_vars
            .insert("nevents".to_string(), json!("5000"));

        let replacements = card_replacements(&dataset, &campaign);
        assert_eq!(replacements["nevents"], json!("5000"));
        assert_eq!(replacements["ebeam1"], json!("6500"));
    }
}
