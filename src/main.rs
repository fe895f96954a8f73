use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::*;
use regex::Regex;

mod aggregate;
mod errors;
mod events;
mod lineages;
mod recfile;
mod translate;
mod utils;

use crate::aggregate::{parse_events, Outputs, ParseSettings};
use crate::errors::RuntimeError;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Settings {
    /// file listing the reconciliation files to process, one path per line
    #[clap(short, long)]
    rec_list: String,

    /// population table: `<ancestral label>\t<space-separated members>`
    #[clap(long, requires = "reftree")]
    populations: Option<String>,

    /// full reference species tree, with branch lengths
    #[clap(long)]
    reftree: Option<String>,

    /// tabulated gene/family membership; requires at least the cds_code,
    /// replaced_cds_code and gene_family_id columns
    #[clap(long)]
    genefams: Option<String>,

    /// event kinds to record, a subset of DTLS
    #[clap(long, default_value = "DTS")]
    evtype: String,

    /// discard events observed in less than this fraction of a sample
    #[clap(long, default_value_t = 0.)]
    minfreq: f64,

    /// only record events located on the descendants of these
    /// comma-separated species tree clades
    #[clap(long)]
    restrict_clade: Option<String>,

    /// separator between the species label and the gene copy suffix
    #[clap(long, default_value_t = events::DEFAULT_SEPARATOR)]
    separator: char,

    /// keep a single representative of the leaves sharing a tag captured by
    /// this pattern
    #[clap(long)]
    dedup_pattern: Option<String>,

    /// materialize per-tree event lists before reducing; heavier, but exact
    /// per-tree detail is preserved while counting
    #[clap(long)]
    detailed: bool,

    #[clap(short, long, default_value_t = 0)]
    threads: usize,

    /// write per-family gene lineage event tables under this directory
    #[clap(long)]
    dir_table_out: Option<String>,

    /// save a single snapshot of all parsed events to this file
    #[clap(long)]
    events_to_json: Option<String>,

    /// store parsed events incrementally in this persistent family-keyed map
    #[clap(long)]
    events_to_db: Option<String>,

    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

fn main() -> Result<()> {
    let args = Settings::parse();
    buche::new()
        .verbosity(args.verbose.log_level_filter() as usize)
        .init()
        .unwrap();

    let outputs = Outputs {
        table_dir: args.dir_table_out.as_ref().map(PathBuf::from),
        json_out: args.events_to_json.as_ref().map(PathBuf::from),
        db_out: args.events_to_db.as_ref().map(PathBuf::from),
    };
    if !outputs.any() {
        bail!(RuntimeError::NoOutputSelected);
    }

    rayon::ThreadPoolBuilder::new().num_threads(args.threads).build_global().unwrap();
    info!("Using {} threads", rayon::current_num_threads());

    if let Some(ref dir) = outputs.table_dir {
        for subdir in ["ref_species_tree", "gene_tree_lineages"] {
            fs::create_dir_all(dir.join(subdir))
                .with_context(|| format!("while creating {}", dir.join(subdir).display()))?;
        }
    }

    let files = utils::read_paths_list(&args.rec_list)?;
    info!("{} reconciliation files to process", files.len());
    let gene_families = match args.genefams {
        Some(ref f) => utils::read_gene_families(f)?,
        None => vec![],
    };

    let reference = match args.reftree {
        Some(ref f) => {
            let tree = newick::one_from_filename(f)
                .with_context(|| format!("while opening {}", f.yellow().bold()))?;
            let mut tree = utils::complete_internal_labels(&tree);
            if let Some(ref populations) = args.populations {
                tree =
                    utils::annotate_populations(&tree, &utils::read_populations(populations)?)?;
            }
            let annotated =
                format!("{}_internalPopulations.nwk", f.rsplit_once('.').map(|(s, _)| s).unwrap_or(f.as_str()));
            utils::write_tree(&tree, Path::new(&annotated), false)?;
            info!("reference tree with population labels written to {}", annotated);
            Some(tree)
        }
        None => None,
    };

    let db = match reference {
        Some(ref tree) => {
            let ref_tables = outputs.table_dir.as_ref().map(|d| d.join("ref_species_tree"));
            Some(translate::generate_event_db(tree, ref_tables.as_deref())?)
        }
        None => None,
    };

    let settings = ParseSettings {
        kinds: args.evtype.parse()?,
        separator: args.separator,
        min_frequency: args.minfreq,
        detailed: args.detailed,
        restrict_clades: args.restrict_clade.clone(),
        dedup: args
            .dedup_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("while compiling the dedup pattern")?,
    };

    parse_events(&files, &gene_families, reference.as_ref(), db.as_ref(), &settings, &outputs)?;
    info!("Done.");
    Ok(())
}
