//! Builds the Monte-Carlo configuration fragment filed with the downstream
//! request: named snippets concatenated, then variables substituted from
//! the dataset and campaign descriptors, the tune import table, and the
//! produced artifact's path.

use anyhow::{anyhow, Context};
use serde_json::Value;
use tracing::info;

use crate::generator::substitute_variables;
use crate::gridpack::Gridpack;
use crate::repository::TemplateRepository;

/// The GEN production folder on /eos is synchronized to /cvmfs; fragments
/// must reference the /cvmfs side.
const EOS_SYNC_PREFIX: &str = "/eos/cms/store/group/phys_generator/cvmfs/gridpacks/";
const CVMFS_PREFIX: &str = "/cvmfs/cms.cern.ch/phys_generator/gridpacks/";

pub struct FragmentBuilder<'a> {
    repository: &'a TemplateRepository,
}

impl<'a> FragmentBuilder<'a> {
    pub fn new(repository: &'a TemplateRepository) -> Self {
        FragmentBuilder { repository }
    }

    /// Build the fragment for `gridpack`, pointing it at `archive_path`
    /// (the produced or reused artifact).
    pub fn build_fragment(&self, gridpack: &Gridpack, archive_path: &str) -> anyhow::Result<String> {
        let dataset = self.repository.dataset_card(gridpack)?;
        let campaign = self.repository.campaign_card(gridpack)?;
        info!(
            "list of files for fragment builder: {}",
            dataset.fragment.join(",")
        );

        let fragments_path = self.repository.fragments_path();
        let mut fragment = String::new();
        for file_name in &dataset.fragment {
            let snippet_path = fragments_path.join(file_name);
            let contents = std::fs::read_to_string(&snippet_path)
                .with_context(|| format!("reading {snippet_path}"))?;
            fragment.push_str(contents.trim());
            fragment.push_str("\n\n");
        }

        let imports = self.repository.imports()?;
        let tune = &gridpack.data.tune;
        let tune_import = imports
            .get("tune")
            .and_then(|tunes| tunes.get(tune))
            .cloned()
            .ok_or_else(|| anyhow!("no import known for tune {tune}"))?;

        let mut replacements = dataset.fragment_vars.clone();
        replacements.extend(campaign.fragment_vars.clone());
        replacements.insert("tuneName".to_string(), Value::String(tune.clone()));
        replacements.insert(
            "comEnergy".to_string(),
            Value::from((campaign.beam * 2.0) as i64),
        );
        replacements.insert("tuneImport".to_string(), tune_import);
        replacements.insert(
            "pathToProducedGridpack".to_string(),
            Value::String(archive_path.replace(EOS_SYNC_PREFIX, CVMFS_PREFIX)),
        );

        Ok(substitute_variables(&fragment, &replacements))
    }
}
