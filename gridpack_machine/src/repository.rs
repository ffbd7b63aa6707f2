//! Read-only view of the GridpackFiles checkout: campaign descriptors,
//! dataset cards, fragment snippets and the tune import table, plus the
//! upstream genproductions branch list. Refreshed periodically from the
//! version-controlled tree.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::gridpack::Gridpack;
use crate::{now_seconds, MachineConf};

const BRANCHES_PER_PAGE: usize = 30;
const MAX_BRANCH_PAGES: usize = 25;

/// Campaign descriptor, `Campaigns/<name>/<name>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignCard {
    pub beam: f64,
    pub tune: String,
    pub chain: String,
    pub template_vars: BTreeMap<String, Value>,
    pub fragment_vars: BTreeMap<String, Value>,
}

/// Dataset descriptor, `Cards/<generator>/<process>/<dataset>/<dataset>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetCard {
    pub template_name: String,
    pub model_params: String,
    pub template_vars: BTreeMap<String, Value>,
    // Lines appended verbatim under the user-settings banner.
    pub user: Vec<String>,
    #[serde(deserialize_with = "string_or_seq")]
    pub fragment: Vec<String>,
    pub fragment_vars: BTreeMap<String, Value>,
    // Tri-state: absent means submit, `false` means reuse an artifact.
    pub gridpack_submit: Option<bool>,
    pub gridpack_path: Option<String>,
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrSeq::deserialize(deserializer)? {
        StringOrSeq::One(one) => vec![one],
        StringOrSeq::Many(many) => many,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CampaignInfo {
    pub generators: Vec<String>,
    pub tune: String,
}

/// The cached catalog served to validation and the UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepositoryTree {
    pub campaigns: BTreeMap<String, CampaignInfo>,
    // generator -> process -> datasets
    pub cards: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub branches: Vec<String>,
    pub tunes: Vec<String>,
}

pub struct TemplateRepository {
    conf: Arc<MachineConf>,
    tree: RwLock<RepositoryTree>,
    last_refresh: AtomicI64,
}

impl TemplateRepository {
    pub fn new(conf: Arc<MachineConf>) -> Self {
        TemplateRepository {
            conf,
            tree: RwLock::new(RepositoryTree::default()),
            last_refresh: AtomicI64::new(0),
        }
    }

    pub fn tree(&self) -> RepositoryTree {
        self.tree.read().clone()
    }

    pub fn last_refresh(&self) -> i64 {
        self.last_refresh.load(Ordering::SeqCst)
    }

    /// Swap in a freshly scanned tree. Public so deployments that seed the
    /// catalog out of band (and tests) can install one directly.
    pub fn install_tree(&self, tree: RepositoryTree) {
        *self.tree.write() = tree;
    }

    /// Pull the checkout, re-list upstream branches and rescan. Rate
    /// limited: refreshes closer together than the configured pause are
    /// dropped.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let now = now_seconds();
        let pause = self.conf.repository_tick_pause.as_secs() as i64;
        if now - pause < self.last_refresh.load(Ordering::SeqCst) {
            info!("not updating repository, last update happened recently");
            return Ok(());
        }

        self.pull_checkout().await?;
        let mut branches = fetch_git_branches(&self.conf.gen_repository).await?;
        branches.reverse();

        let tree = self.scan(branches)?;
        self.install_tree(tree);
        self.last_refresh.store(now_seconds(), Ordering::SeqCst);
        Ok(())
    }

    /// `git checkout . && git pull` in the checkout, after verifying that
    /// the tree actually tracks the expected remote.
    async fn pull_checkout(&self) -> anyhow::Result<()> {
        let path = &self.conf.gridpack_files_path;
        debug!("pulling the repository located at {path}");

        let origin = run_git(path, &["remote", "get-url", "origin"]).await?;
        if origin.trim() != self.conf.gridpack_files_repository {
            bail!(
                "the remote origin doesn't match. received: {} - expected: {}",
                origin.trim(),
                self.conf.gridpack_files_repository
            );
        }

        run_git(path, &["checkout", "."]).await?;
        run_git(path, &["pull"]).await?;
        Ok(())
    }

    fn scan(&self, branches: Vec<String>) -> anyhow::Result<RepositoryTree> {
        let files_path = &self.conf.gridpack_files_path;

        let mut campaigns = BTreeMap::new();
        let campaigns_dir = files_path.join("Campaigns");
        for name in list_subdirectories(&campaigns_dir)? {
            let campaign_path = campaigns_dir.join(&name);
            let descriptor = campaign_path.join(format!("{name}.json"));
            let contents = std::fs::read_to_string(&descriptor)
                .with_context(|| format!("reading {descriptor}"))?;
            let card: CampaignCard = serde_json::from_str(&contents)
                .with_context(|| format!("parsing {descriptor}"))?;
            campaigns.insert(
                name.clone(),
                CampaignInfo {
                    generators: list_subdirectories(&campaign_path)?,
                    tune: card.tune,
                },
            );
        }

        let mut cards: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        let cards_dir = files_path.join("Cards");
        for generator in list_subdirectories(&cards_dir)? {
            let generator_path = cards_dir.join(&generator);
            for process in list_subdirectories(&generator_path)? {
                let datasets = list_subdirectories(&generator_path.join(&process))?;
                cards
                    .entry(generator.clone())
                    .or_default()
                    .insert(process, datasets);
            }
        }

        let tunes = match self.imports() {
            Ok(imports) => {
                let mut tunes: Vec<String> = imports
                    .get("tune")
                    .and_then(Value::as_object)
                    .map(|tune_map| tune_map.keys().cloned().collect())
                    .unwrap_or_default();
                tunes.sort();
                tunes
            }
            Err(_) => Vec::new(),
        };

        Ok(RepositoryTree {
            campaigns,
            cards,
            branches,
            tunes,
        })
    }

    pub fn fragments_path(&self) -> Utf8PathBuf {
        self.conf.gridpack_files_path.join("Fragments")
    }

    /// The tune import table, `Fragments/imports.json`.
    pub fn imports(&self) -> anyhow::Result<Value> {
        let imports_path = self.fragments_path().join("imports.json");
        let contents = std::fs::read_to_string(&imports_path)
            .with_context(|| format!("reading {imports_path}"))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {imports_path}"))
    }

    pub fn dataset_card(&self, gridpack: &Gridpack) -> anyhow::Result<DatasetCard> {
        let card_path = gridpack
            .cards_path(&self.conf)
            .join(format!("{}.json", gridpack.data.dataset));
        debug!("reading {card_path}");
        let contents = std::fs::read_to_string(&card_path)
            .with_context(|| format!("reading {card_path}"))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {card_path}"))
    }

    pub fn campaign_card(&self, gridpack: &Gridpack) -> anyhow::Result<CampaignCard> {
        let card_path = gridpack
            .campaign_path(&self.conf)
            .join(format!("{}.json", gridpack.data.campaign));
        debug!("reading {card_path}");
        let contents = std::fs::read_to_string(&card_path)
            .with_context(|| format!("reading {card_path}"))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {card_path}"))
    }
}

fn list_subdirectories(path: &Utf8PathBuf) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(path).with_context(|| format!("listing {path}"))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

async fn run_git(path: &Utf8PathBuf, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("running git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed in {path}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// All branch names of a GitHub repository, oldest first, scanning up to
/// `MAX_BRANCH_PAGES` pages of the REST API.
pub async fn fetch_git_branches(repository: &str) -> anyhow::Result<Vec<String>> {
    debug!(
        "scanning a maximum of {} branches from repo {repository}",
        MAX_BRANCH_PAGES * BRANCHES_PER_PAGE
    );
    let client = reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (X11; Linux x86_64)")
        .build()?;

    let mut all_branches = Vec::new();
    for page in 1..=MAX_BRANCH_PAGES {
        let url = format!(
            "https://api.github.com/repos/{repository}/branches?per_page={BRANCHES_PER_PAGE}&page={page}"
        );
        let response: Vec<Value> = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("decoding branch listing page {page}"))?;
        let branches: Vec<String> = response
            .iter()
            .filter_map(|branch| branch.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        debug!(
            "found {} branches in {repository} on page {page}",
            branches.len()
        );
        if branches.is_empty() {
            break;
        }
        all_branches.extend(branches);
    }

    debug!(
        "found {} branches in total for repo {repository}",
        all_branches.len()
    );
    Ok(all_branches)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    /// Lay out a minimal GridpackFiles checkout for one campaign/dataset.
    pub(crate) fn write_template_tree(root: &Utf8TempDir) {
        let base = root.path();
        let campaign = base.join("Campaigns/C1");
        std::fs::create_dir_all(campaign.join("MadGraph5_aMCatNLO/Templates")).unwrap();
        std::fs::create_dir_all(campaign.join("MadGraph5_aMCatNLO/ModelParams")).unwrap();
        std::fs::write(
            campaign.join("C1.json"),
            serde_json::json!({
                "beam": 6500,
                "tune": "CP5",
                "chain": "chain_C1_flowLHE",
                "template_vars": {"maxjetflavor": "5"},
                "fragment_vars": {"processParameters": ["'a = 1'", "'b = 2'"]},
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            campaign.join("MadGraph5_aMCatNLO/Templates/NLO_run_card.dat"),
            "ebeam1 = $ebeam1\nebeam2 = $ebeam2\nmaxjetflavor = $maxjetflavor\n",
        )
        .unwrap();
        std::fs::write(
            campaign.join("MadGraph5_aMCatNLO/ModelParams/scheme5"),
            "set param_card mass 6 172.5\n",
        )
        .unwrap();

        let dataset = base.join("Cards/MadGraph5_aMCatNLO/P/D_NLO");
        std::fs::create_dir_all(&dataset).unwrap();
        std::fs::write(dataset.join("proc_card.dat"), "generate p p > t t~\n").unwrap();
        std::fs::write(
            dataset.join("D_NLO.json"),
            serde_json::json!({
                "template_name": "NLO_run_card.dat",
                "model_params": "scheme5",
                "template_vars": {"nevents": "5000"},
                "user": ["set param_card yukawa 6 172.5"],
                "fragment": ["Pythia8/aMCatNLO.dat"],
                "fragment_vars": {"filterEfficiency": "1.0"},
            })
            .to_string(),
        )
        .unwrap();

        let fragments = base.join("Fragments/Pythia8");
        std::fs::create_dir_all(&fragments).unwrap();
        std::fs::write(
            base.join("Fragments/Pythia8/aMCatNLO.dat"),
            "import FWCore.ParameterSet.Config as cms\nargs = cms.vstring('$pathToProducedGridpack')\ncomEnergy = cms.double($comEnergy)\n$tuneImport\nprocessParameters = cms.vstring(\n    $processParameters\n)\n",
        )
        .unwrap();
        std::fs::write(
            base.join("Fragments/imports.json"),
            serde_json::json!({
                "tune": {
                    "CP5": "from Configuration.Generator.MCTunes2017.PythiaCP5Settings_cfi import *",
                    "CP1": "from Configuration.Generator.MCTunes2017.PythiaCP1Settings_cfi import *",
                }
            })
            .to_string(),
        )
        .unwrap();
    }

    /// Repository over an existing conf, scanned from its files path.
    pub(crate) fn repository_for(conf: Arc<MachineConf>) -> TemplateRepository {
        let repository = TemplateRepository::new(conf);
        let tree = repository.scan(vec!["main".to_string()]).unwrap();
        repository.install_tree(tree);
        repository
    }

    pub(crate) fn repository_with_tree(root: &Utf8TempDir) -> (Arc<MachineConf>, TemplateRepository) {
        let mut conf = MachineConf::dummy();
        conf.gridpack_files_path = root.path().to_path_buf();
        let conf = Arc::new(conf);
        (conf.clone(), repository_for(conf))
    }

    #[test]
    fn scan_collects_campaigns_cards_and_tunes() {
        let root = Utf8TempDir::new().unwrap();
        write_template_tree(&root);
        let (_conf, repository) = repository_with_tree(&root);

        let tree = repository.tree();
        assert_eq!(tree.branches, vec!["main"]);
        assert_eq!(
            tree.campaigns["C1"].generators,
            vec!["MadGraph5_aMCatNLO"]
        );
        assert_eq!(tree.campaigns["C1"].tune, "CP5");
        assert_eq!(tree.cards["MadGraph5_aMCatNLO"]["P"], vec!["D_NLO"]);
        assert_eq!(tree.tunes, vec!["CP1", "CP5"]);
    }

    #[test]
    fn dataset_card_parses_fragment_as_string_or_list() {
        let single: DatasetCard =
            serde_json::from_str(r#"{"fragment": "Pythia8/one.dat"}"#).unwrap();
        assert_eq!(single.fragment, vec!["Pythia8/one.dat"]);

        let many: DatasetCard =
            serde_json::from_str(r#"{"fragment": ["a.dat", "b.dat"]}"#).unwrap();
        assert_eq!(many.fragment, vec!["a.dat", "b.dat"]);
    }

    #[test]
    fn cards_resolve_through_gridpack_paths() {
        let root = Utf8TempDir::new().unwrap();
        write_template_tree(&root);
        let (_conf, repository) = repository_with_tree(&root);

        let gridpack = Gridpack::make(crate::gridpack::tests::test_data("1")).unwrap();
        let dataset = repository.dataset_card(&gridpack).unwrap();
        assert_eq!(dataset.template_name, "NLO_run_card.dat");
        assert_eq!(dataset.model_params, "scheme5");
        assert_eq!(dataset.gridpack_submit, None);

        let campaign = repository.campaign_card(&gridpack).unwrap();
        assert_eq!(campaign.beam, 6500.0);
        assert_eq!(campaign.chain, "chain_C1_flowLHE");
    }
}
