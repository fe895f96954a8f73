use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use either::Either;
use indicatif::{ParallelProgressIterator, ProgressBar};
use itertools::Itertools;
use log::*;
use newick::NewickTree;
use rayon::prelude::*;
use regex::Regex;
use serde_json::{json, Value};

use crate::errors::{FileError, RuntimeError};
use crate::events::{EventKinds, FrequencyCache};
use crate::lineages::{decode_gene_tree, DecodeOptions, LineageAccumulator};
use crate::recfile::{read_reconciliation, ReadOptions};
use crate::translate::{translate_events, translate_species_tree, EventKey, EventRefDB};
use crate::utils::{label_map, open_file, GeneFamilyRow};

/// Sampled event counts for every gene lineage of one family.
pub type FamilyEvents = HashMap<String, HashMap<EventKey, u32>>;

pub struct ParseSettings {
    pub kinds: EventKinds,
    pub separator: char,
    /// Events observed in fewer than `min_frequency * nsample` trees of a
    /// sample are pruned.
    pub min_frequency: f64,
    /// Materialize every lineage's per-tree event list before reducing,
    /// instead of updating counts incrementally. Heavier, but preserves the
    /// per-tree detail while counting.
    pub detailed: bool,
    pub restrict_clades: Option<String>,
    /// Pattern collapsing leaves that stand for the same replaced clade.
    pub dedup: Option<Regex>,
}

/// The family a reconciliation file belongs to, from its file name.
pub fn family_id(filename: &str) -> Result<String> {
    Path::new(filename)
        .file_name()
        .and_then(|f| f.to_str())
        .map(|f| f.split('-').next().unwrap().to_owned())
        .ok_or_else(|| FileError::InvalidFilename(filename.to_owned()).into())
}

/// Parse one reconciled gene tree sample and return the sampled events by
/// gene lineage.
pub fn parse_rec(
    filename: &str,
    reference: Option<&NewickTree>,
    db: Option<&EventRefDB>,
    only_lineages: &[String],
    table_dir: Option<&Path>,
    settings: &ParseSettings,
) -> Result<FamilyEvents> {
    debug!("Parsing {}", filename);
    let rec = read_reconciliation(
        BufReader::new(open_file(filename)?),
        &ReadOptions {
            restrict_clades: settings.restrict_clades.as_deref(),
            ..Default::default()
        },
    )?;
    let nsample = rec.nsample();
    if nsample == 0 {
        warn!("{} contains an empty sample", filename);
        return Ok(Default::default());
    }

    let translation = match reference {
        Some(reference) => translate_species_tree(&rec.species_tree, reference)?.labels,
        None => Default::default(),
    };
    let species_labels = label_map(&rec.species_tree);
    let decode_options = DecodeOptions {
        kinds: settings.kinds,
        separator: settings.separator,
        restricted_labels: &rec.restricted_labels,
    };

    let mut frequencies = FrequencyCache::new();
    let mut counts = FamilyEvents::new();
    let mut by_tree = HashMap::<String, Vec<Vec<EventKey>>>::new();
    for recgt in rec.gene_trees.iter() {
        let node_events = decode_gene_tree(
            recgt,
            &rec.species_tree,
            &species_labels,
            &mut frequencies,
            &rec.sample,
            nsample,
            &decode_options,
        )?;
        let lineages = LineageAccumulator::new().lineages(
            recgt,
            &node_events,
            only_lineages,
            settings.dedup.as_ref(),
        )?;

        for (gene, events) in lineages.into_iter() {
            let translated = translate_events(&events, &translation, db)?;
            if settings.detailed {
                by_tree.entry(gene).or_default().push(translated);
            } else {
                for event in translated.into_iter() {
                    *counts.entry(gene.clone()).or_default().entry(event).or_insert(0) += 1;
                }
            }
        }
    }

    if settings.detailed {
        // combine the per-tree event lists across the sample
        for (gene, trees) in by_tree.into_iter() {
            let mut combined = HashMap::<EventKey, u32>::new();
            for event in trees.into_iter().flatten() {
                *combined.entry(event).or_insert(0) += 1;
            }
            counts.insert(gene, combined);
        }
    }

    if settings.min_frequency > 0. {
        for events in counts.values_mut() {
            events.retain(|_, &mut n| n as f64 / nsample as f64 >= settings.min_frequency);
        }
    }

    if let Some(dir) = table_dir {
        write_lineage_table(dir, filename, settings, &counts)?;
    }

    debug!("{} done ({} cached event frequencies)", filename, frequencies.len());
    Ok(counts)
}

/// One line per (gene, event, frequency) tuple, tab-separated.
fn write_lineage_table(
    dir: &Path,
    filename: &str,
    settings: &ParseSettings,
    counts: &FamilyEvents,
) -> Result<()> {
    let basename = Path::new(filename)
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| FileError::InvalidFilename(filename.to_owned()))?;
    let out_name = dir.join(format!("{}.{}.eventlineages", basename, settings.kinds));
    let mut out = BufWriter::new(
        File::create(&out_name)
            .with_context(|| format!("while creating {}", out_name.display()))?,
    );

    for gene in counts.keys().sorted() {
        for (event, freq) in counts[gene].iter().sorted_by_key(|(e, _)| (*e).clone()) {
            match event {
                Either::Left(event) => writeln!(
                    out,
                    "{}\t{}\t{}\t{}",
                    gene,
                    event.kind(),
                    event.locations().join("\t"),
                    freq
                )?,
                Either::Right(id) => writeln!(out, "{}\t{}\t{}", gene, id, freq)?,
            }
        }
    }
    out.flush()?;
    info!("stored events listed by gene lineage in {}", out_name.display());
    Ok(())
}

pub struct Outputs {
    pub table_dir: Option<PathBuf>,
    pub json_out: Option<PathBuf>,
    pub db_out: Option<PathBuf>,
}

impl Outputs {
    pub fn any(&self) -> bool {
        self.table_dir.is_some() || self.json_out.is_some() || self.db_out.is_some()
    }
}

fn event_key_value(key: &EventKey) -> Value {
    match key {
        Either::Left(event) => {
            let mut entry = vec![json!(event.kind().to_string())];
            entry.extend(event.locations().iter().map(|l| json!(l)));
            Value::Array(entry)
        }
        Either::Right(id) => json!(id),
    }
}

fn family_events_value(events: &FamilyEvents) -> Value {
    Value::Object(
        events
            .iter()
            .sorted_by_key(|(gene, _)| gene.to_owned())
            .map(|(gene, counts)| {
                let entries = counts
                    .iter()
                    .sorted_by_key(|(event, _)| (*event).clone())
                    .map(|(event, freq)| json!([event_key_value(event), freq]))
                    .collect::<Vec<_>>();
                (gene.clone(), Value::Array(entries))
            })
            .collect(),
    )
}

/// Process every reconciliation file of the run, one rayon task per file,
/// and hand the merged family-keyed results to the selected sinks.
pub fn parse_events(
    files: &[String],
    gene_families: &[GeneFamilyRow],
    reference: Option<&NewickTree>,
    db: Option<&EventRefDB>,
    settings: &ParseSettings,
    outputs: &Outputs,
) -> Result<()> {
    if !outputs.any() {
        bail!(RuntimeError::NoOutputSelected);
    }

    let families = files.iter().map(|f| family_id(f)).collect::<Result<Vec<_>>>()?;
    let only_lineages = gene_families
        .iter()
        .filter(|row| families.iter().any(|f| *f == row.gene_family_id))
        .map(|row| row.gene_label().to_owned())
        .collect::<Vec<_>>();
    if !gene_families.is_empty() {
        info!("Restricting to {} gene lineages", only_lineages.len());
    }

    let lineage_table_dir = outputs.table_dir.as_ref().map(|d| d.join("gene_tree_lineages"));
    let bar = if atty::is(atty::Stream::Stdout) {
        ProgressBar::new(files.len() as u64)
    } else {
        ProgressBar::hidden()
    };
    let results = files
        .par_iter()
        .progress_with(bar)
        .map(|f| {
            parse_rec(
                f,
                reference,
                db,
                &only_lineages,
                lineage_table_dir.as_deref(),
                settings,
            )
            .with_context(|| format!("while processing {}", f))
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(ref db_out) = outputs.db_out {
        info!("storing event tuples in persistent map {}", db_out.display());
        let conn = rusqlite::Connection::open(db_out)
            .with_context(|| format!("while opening {}", db_out.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS family_events (family TEXT PRIMARY KEY, events TEXT)",
            [],
        )?;
        for (family, events) in families.iter().zip(results.iter()) {
            conn.execute(
                "INSERT OR REPLACE INTO family_events (family, events) VALUES (?1, ?2)",
                rusqlite::params![family, family_events_value(events).to_string()],
            )?;
        }
    } else if let Some(ref json_out) = outputs.json_out {
        info!("saving parsed events to {}", json_out.display());
        let snapshot = Value::Object(
            families
                .iter()
                .zip(results.iter())
                .map(|(family, events)| (family.clone(), family_events_value(events)))
                .collect(),
        );
        serde_json::to_writer(
            BufWriter::new(File::create(json_out).with_context(|| {
                format!("while creating {}", json_out.display())
            })?),
            &snapshot,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::utils::tree_from_string;
    use std::io::Write as _;

    const REC: &str = "\
S:\t(A,(B,C)BC)ABC;
reconciled G-s:

((A_g1.T@A->B.D@ABC,B_g1)X,C_g1)Y;
((A_g1.T@A->B,B_g1)X,C_g1)Y;
# end of sample
";

    fn settings(kinds: &str, min_frequency: f64, detailed: bool) -> ParseSettings {
        ParseSettings {
            kinds: kinds.parse().unwrap(),
            separator: '_',
            min_frequency,
            detailed,
            restrict_clades: None,
            dedup: None,
        }
    }

    fn write_rec(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(REC.as_bytes()).unwrap();
        path.to_str().unwrap().to_owned()
    }

    fn transfer() -> EventKey {
        Either::Left(Event::Transfer { donor: "A".into(), recipient: "B".into() })
    }

    fn duplication() -> EventKey {
        Either::Left(Event::Duplication { location: "ABC".into() })
    }

    #[test]
    fn family_ids_derive_from_file_names() {
        assert_eq!(family_id("/tmp/FAM000123-collapsed.uml_rec").unwrap(), "FAM000123");
        assert_eq!(family_id("FAM4.rec").unwrap(), "FAM4.rec");
    }

    #[test]
    fn events_at_half_frequency_survive_a_half_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let counts = parse_rec(&rec, None, None, &[], None, &settings("DT", 0.5, false)).unwrap();

        // the transfer is seen in both trees, the duplication in one of two
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["A_g1"][&transfer()], 2);
        assert_eq!(counts["A_g1"][&duplication()], 1);
    }

    #[test]
    fn a_full_support_threshold_keeps_only_ubiquitous_events() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let counts = parse_rec(&rec, None, None, &[], None, &settings("DT", 1.0, false)).unwrap();

        assert_eq!(counts["A_g1"].len(), 1);
        assert_eq!(counts["A_g1"][&transfer()], 2);
        assert!(counts["A_g1"].get(&duplication()).is_none());
    }

    #[test]
    fn lineage_counts_never_exceed_the_sample_size() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let counts =
            parse_rec(&rec, None, None, &[], None, &settings("DTLS", 0., false)).unwrap();

        for events in counts.values() {
            for &n in events.values() {
                assert!(n as usize <= 2);
            }
        }
    }

    #[test]
    fn detailed_and_incremental_modes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let incremental =
            parse_rec(&rec, None, None, &[], None, &settings("DTS", 0.5, false)).unwrap();
        let detailed =
            parse_rec(&rec, None, None, &[], None, &settings("DTS", 0.5, true)).unwrap();
        assert_eq!(incremental, detailed);
    }

    #[test]
    fn lineage_whitelists_drop_other_genes() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let counts = parse_rec(
            &rec,
            None,
            None,
            &["B_g1".to_string()],
            None,
            &settings("DT", 0., false),
        )
        .unwrap();
        assert!(counts.is_empty());
    }

    #[test]
    fn translation_compacts_events_to_reference_ids() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let reference = tree_from_string("(A,(B,C)BC)ABC;").unwrap();
        let db = crate::translate::generate_event_db(&reference, None).unwrap();
        let counts = parse_rec(
            &rec,
            Some(&reference),
            Some(&db),
            &[],
            None,
            &settings("DT", 0., false),
        )
        .unwrap();

        let expected_transfer = db
            .id(&Event::Transfer { donor: "A".into(), recipient: "B".into() })
            .unwrap();
        assert_eq!(counts["A_g1"][&Either::Right(expected_transfer)], 2);
    }

    #[test]
    fn lineage_tables_list_one_event_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        parse_rec(&rec, None, None, &[], Some(dir.path()), &settings("DT", 0., false)).unwrap();

        let table =
            std::fs::read_to_string(dir.path().join("FAM1-x.rec.DT.eventlineages")).unwrap();
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| *l == "A_g1\tD\tABC\t1"));
        assert!(lines.iter().any(|l| *l == "A_g1\tT\tA\tB\t2"));
    }

    #[test]
    fn the_json_sink_snapshots_every_family() {
        let dir = tempfile::tempdir().unwrap();
        let rec1 = write_rec(dir.path(), "FAM1-x.rec");
        let rec2 = write_rec(dir.path(), "FAM2-y.rec");
        let json_out = dir.path().join("events.json");

        parse_events(
            &[rec1, rec2],
            &[],
            None,
            None,
            &settings("DT", 0., false),
            &Outputs { table_dir: None, json_out: Some(json_out.clone()), db_out: None },
        )
        .unwrap();

        let snapshot: Value =
            serde_json::from_reader(File::open(&json_out).unwrap()).unwrap();
        assert!(snapshot.get("FAM1").is_some());
        assert!(snapshot.get("FAM2").is_some());
        assert_eq!(snapshot["FAM1"]["A_g1"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn the_persistent_map_sink_keys_by_family() {
        let dir = tempfile::tempdir().unwrap();
        let rec = write_rec(dir.path(), "FAM1-x.rec");
        let db_out = dir.path().join("events.db");

        parse_events(
            &[rec],
            &[],
            None,
            None,
            &settings("DT", 0., false),
            &Outputs { table_dir: None, json_out: None, db_out: Some(db_out.clone()) },
        )
        .unwrap();

        let conn = rusqlite::Connection::open(&db_out).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM family_events WHERE family = 'FAM1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn running_without_a_sink_is_an_error() {
        let r = parse_events(
            &[],
            &[],
            None,
            None,
            &settings("DT", 0., false),
            &Outputs { table_dir: None, json_out: None, db_out: None },
        );
        assert!(r.is_err());
    }
}
