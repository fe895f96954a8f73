use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::BufRead;

use anyhow::{bail, Context, Result};
use newick::{Newick, NewickTree};

use crate::errors::{RecParseError, RuntimeError};
use crate::utils::{label_map, leaf_labels, nodes, restrict_to_leaves, tree_from_string};

/// One parsed reconciliation output file: the (possibly collapsed) species
/// tree the reconciliation was computed against, the sample of reconciled
/// gene trees, and the per-node event frequency table.
pub struct RecFile {
    pub species_tree: NewickTree,
    /// The species tree restricted to the requested clades, if any.
    pub restricted_tree: Option<NewickTree>,
    pub gene_trees: Vec<NewickTree>,
    /// Raw text of the gene tree sample, kept for sample-wide event counting.
    pub sample: String,
    /// Labels found under the restriction clades; empty without restriction.
    pub restricted_labels: Vec<String>,
    /// Node label to event frequency/copy number columns.
    pub node_frequencies: HashMap<String, Vec<f64>>,
}

impl RecFile {
    pub fn nsample(&self) -> usize {
        self.gene_trees.len()
    }
}

#[derive(Default)]
pub struct ReadOptions<'a> {
    /// A tree carrying branch lengths, topologically equivalent to the
    /// reconciliation species tree, to copy lengths from.
    pub reference_lengths: Option<&'a NewickTree>,
    /// Comma-separated labels of clades to restrict the species tree to.
    pub restrict_clades: Option<&'a str>,
    pub skip_node_frequencies: bool,
}

/// Copy branch lengths from `reference` onto the matching clades of `t`.
fn copy_branch_lengths(t: &mut NewickTree, reference: &NewickTree) -> Result<()> {
    let reference_clades = nodes(reference)
        .into_iter()
        .map(|n| (leaf_labels(reference, n).into_iter().collect::<BTreeSet<_>>(), n))
        .collect::<HashMap<_, _>>();

    for n in nodes(t) {
        let clade = leaf_labels(t, n).into_iter().collect::<BTreeSet<_>>();
        let matching = *reference_clades.get(&clade).ok_or(RecParseError::TopologyMismatch)?;
        if let Some(l) = reference.get(matching).unwrap().branch() {
            t.get_mut(n).unwrap().set_branch(l.to_owned());
        }
    }
    Ok(())
}

/// Read one reconciliation output file, section by section.
pub fn read_reconciliation<R: BufRead>(input: R, options: &ReadOptions) -> Result<RecFile> {
    let mut lines = input.lines();

    // 1. The species tree the reconciliation was computed against
    let tree_line = loop {
        match lines.next() {
            Some(l) => {
                let l = l?;
                if l.starts_with("S:\t") {
                    break l;
                }
            }
            None => bail!(RecParseError::SectionMissing("species tree")),
        }
    };
    let mut species_tree = tree_from_string(
        tree_line
            .split('\t')
            .nth(1)
            .ok_or(RecParseError::SectionMissing("species tree"))?,
    )
    .context("while parsing the species tree")?;

    if let Some(reference) = options.reference_lengths {
        copy_branch_lengths(&mut species_tree, reference)?;
    }

    // 2. Optionally restrict to the requested clades
    let mut restricted_labels = Vec::new();
    let restricted_tree = if let Some(clades) = options.restrict_clades {
        let labels = label_map(&species_tree);
        for clade in clades.split(',') {
            let n = *labels
                .get(clade)
                .ok_or_else(|| RuntimeError::SpeciesNotFound(clade.to_owned()))?;
            restricted_labels.extend(
                nodes_below(&species_tree, n)
                    .into_iter()
                    .filter_map(|d| species_tree.name(d).map(|name| name.to_owned())),
            );
        }
        let keep = species_tree
            .leaves()
            .filter_map(|l| species_tree.name(l).map(|name| name.to_owned()))
            .filter(|name| restricted_labels.contains(name))
            .collect::<HashSet<_>>();
        Some(restrict_to_leaves(&species_tree, &keep))
    } else {
        None
    };

    // 3. The reconciled gene tree sample
    loop {
        match lines.next() {
            Some(l) => {
                if l?.ends_with("reconciled G-s:") {
                    break;
                }
            }
            None => bail!(RecParseError::SectionMissing("reconciled gene tree sample")),
        }
    }
    lines.next().transpose()?; // separator line

    let mut gene_trees = Vec::new();
    let mut sample = String::new();
    loop {
        let line = match lines.next() {
            Some(l) => l?,
            None => bail!(RecParseError::SectionMissing("gene tree sample terminator")),
        };
        if line.starts_with('#') {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        sample.push_str(&line);
        sample.push('\n');
        gene_trees.push(
            tree_from_string(line.trim())
                .with_context(|| format!("while parsing gene tree #{}", gene_trees.len() + 1))?,
        );
    }

    // 4. The per-node event frequency table
    let mut node_frequencies = HashMap::new();
    if !options.skip_node_frequencies {
        for _ in 0..3 {
            lines.next().transpose()?;
        }
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let columns = line.split('\t').collect::<Vec<_>>();
            if columns.len() < 2 {
                bail!(RecParseError::ErroneousFrequencyLine(line.to_owned()));
            }
            let values = columns[2..]
                .iter()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| RecParseError::ErroneousFrequencyLine(line.to_owned()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            node_frequencies.insert(columns[1].to_owned(), values);
        }
    }

    Ok(RecFile {
        species_tree,
        restricted_tree,
        gene_trees,
        sample,
        restricted_labels,
        node_frequencies,
    })
}

/// All nodes strictly below `n`, in preorder.
fn nodes_below(t: &NewickTree, n: newick::NodeID) -> Vec<newick::NodeID> {
    t.children(n)
        .unwrap()
        .iter()
        .flat_map(|&c| {
            let mut r = vec![c];
            r.extend(nodes_below(t, c));
            r
        })
        .collect()
}
