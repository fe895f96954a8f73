use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};
use identity_hash::IntMap;
use newick::{Newick, NewickTree, NodeID};
use serde::Deserialize;

use crate::errors::{FileError, RuntimeError};

pub fn open_file(filename: &str) -> Result<File, FileError> {
    File::open(filename)
        .map_err(|source| FileError::CannotOpen { source, filename: filename.to_owned() })
}

/// Parse the first tree of a Newick string.
pub fn tree_from_string(s: &str) -> Result<NewickTree> {
    let mut trees = newick::from_string(s)?;
    ensure!(!trees.is_empty(), "no tree found in `{}`", s);
    Ok(trees.remove(0))
}

/// All node IDs of `t`, in preorder from the root.
pub fn nodes(t: &NewickTree) -> Vec<NodeID> {
    fn rec_nodes(t: &NewickTree, n: NodeID, ax: &mut Vec<NodeID>) {
        ax.push(n);
        for c in t.children(n).unwrap().iter() {
            rec_nodes(t, *c, ax);
        }
    }

    let mut r = Vec::new();
    rec_nodes(t, t.root(), &mut r);
    r
}

/// A name-to-ID mapping of the labeled nodes of `t`.
pub fn label_map(t: &NewickTree) -> HashMap<String, NodeID> {
    nodes(t)
        .into_iter()
        .filter_map(|n| t.name(n).map(|name| (name.to_owned(), n)))
        .collect()
}

/// The labels of the leaves under `n`.
pub fn leaf_labels(t: &NewickTree, n: NodeID) -> Vec<String> {
    t.leaves_of(n)
        .iter()
        .filter_map(|&l| t.name(l).map(|name| name.to_owned()))
        .collect()
}

fn rec_copy(
    src: &NewickTree,
    n: NodeID,
    dst: &mut NewickTree,
    parent: Option<NodeID>,
    renames: &IntMap<NodeID, String>,
) {
    let name =
        renames.get(&n).cloned().or_else(|| src.name(n).map(|name| name.to_owned()));
    let id = dst.add_node(parent, newick::Data { name, attrs: Default::default() });
    if let Some(l) = src.get(n).unwrap().branch() {
        dst.get_mut(id).unwrap().set_branch(l.to_owned());
    }
    for c in src.children(n).unwrap().iter() {
        rec_copy(src, *c, dst, Some(id), renames);
    }
}

/// A copy of `t` with the names in `renames` substituted.
pub fn relabeled_copy(t: &NewickTree, renames: &IntMap<NodeID, String>) -> NewickTree {
    let mut r = NewickTree::new();
    rec_copy(t, t.root(), &mut r, None, renames);
    r
}

/// A copy of `t` where every unnamed node received a fresh `N<i>` label.
pub fn complete_internal_labels(t: &NewickTree) -> NewickTree {
    let taken = nodes(t)
        .iter()
        .filter_map(|&n| t.name(n).map(|name| name.to_owned()))
        .collect::<HashSet<_>>();
    let mut next = 0;
    let mut renames = IntMap::<NodeID, String>::default();
    for n in nodes(t) {
        if t.name(n).is_none() {
            let label = loop {
                let candidate = format!("N{}", next);
                next += 1;
                if !taken.contains(&candidate) {
                    break candidate;
                }
            };
            renames.insert(n, label);
        }
    }
    relabeled_copy(t, &renames)
}

/// A copy of `t` containing only the leaves in `keep`, with single-child
/// chains collapsed onto their lower end.
pub fn restrict_to_leaves(t: &NewickTree, keep: &HashSet<String>) -> NewickTree {
    struct Clade {
        node: NodeID,
        children: Vec<Clade>,
    }

    fn rec_restrict(t: &NewickTree, n: NodeID, keep: &HashSet<String>) -> Option<Clade> {
        if t[n].is_leaf() {
            t.name(n)
                .filter(|name| keep.contains(*name))
                .map(|_| Clade { node: n, children: vec![] })
        } else {
            let mut children = t
                .children(n)
                .unwrap()
                .iter()
                .filter_map(|&c| rec_restrict(t, c, keep))
                .collect::<Vec<_>>();
            match children.len() {
                0 => None,
                1 => children.pop(),
                _ => Some(Clade { node: n, children }),
            }
        }
    }

    fn rec_build(src: &NewickTree, clade: &Clade, dst: &mut NewickTree, parent: Option<NodeID>) {
        let id = dst.add_node(
            parent,
            newick::Data {
                name: src.name(clade.node).map(|name| name.to_owned()),
                attrs: Default::default(),
            },
        );
        for c in clade.children.iter() {
            rec_build(src, c, dst, Some(id));
        }
    }

    let mut r = NewickTree::new();
    match rec_restrict(t, t.root(), keep) {
        Some(clade) => rec_build(t, &clade, &mut r, None),
        None => {
            r.add_node(None, newick::Data { name: None, attrs: Default::default() });
        }
    }
    r
}

/// Relabel the ancestral node of each population with the population name.
pub fn annotate_populations(
    t: &NewickTree,
    populations: &[(String, Vec<String>)],
) -> Result<NewickTree> {
    let labels = label_map(t);
    let mut renames = IntMap::<NodeID, String>::default();
    for (name, members) in populations.iter() {
        let ids = members
            .iter()
            .map(|m| {
                labels.get(m).copied().ok_or_else(|| RuntimeError::SpeciesNotFound(m.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ancestor = t
            .mrca(ids)
            .ok()
            .ok_or_else(|| RuntimeError::SpeciesNotFound(name.to_owned()))?;
        renames.insert(ancestor, name.to_owned());
    }
    Ok(relabeled_copy(t, &renames))
}

pub fn write_tree(t: &NewickTree, filename: &Path, with_attrs: bool) -> Result<()> {
    File::create(filename)
        .map_err(|source| FileError::WhileCreating {
            source,
            filename: filename.display().to_string(),
        })?
        .write_all(Newick::to_newick(t, with_attrs).as_bytes())?;
    Ok(())
}

/// Read a list of paths, one per line, skipping blank lines.
pub fn read_paths_list(filename: &str) -> Result<Vec<String>> {
    BufReader::new(open_file(filename)?)
        .lines()
        .map(|l| l.with_context(|| format!("while reading {}", filename)))
        .filter(|l| l.as_ref().map(|l| !l.trim().is_empty()).unwrap_or(true))
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct GeneFamilyRow {
    pub cds_code: String,
    #[serde(default)]
    pub replaced_cds_code: Option<String>,
    pub gene_family_id: String,
}

impl GeneFamilyRow {
    /// The gene label under which this gene appears in reconciled trees.
    pub fn gene_label(&self) -> &str {
        match self.replaced_cds_code.as_deref() {
            Some(replaced) if !replaced.is_empty() => replaced,
            _ => &self.cds_code,
        }
    }
}

/// Read the tab-separated gene/family membership table.
pub fn read_gene_families(filename: &str) -> Result<Vec<GeneFamilyRow>> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_reader(open_file(filename)?)
        .deserialize()
        .map(|row| row.with_context(|| format!("while reading {}", filename)))
        .collect()
}

/// Read the population table: `<ancestral label>\t<space-separated members>`.
pub fn read_populations(filename: &str) -> Result<Vec<(String, Vec<String>)>> {
    let mut r = Vec::new();
    for line in BufReader::new(open_file(filename)?).lines() {
        let line = line.with_context(|| format!("while reading {}", filename))?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let mut columns = line.split('\t');
        let name = columns
            .next()
            .with_context(|| format!("no population name in `{}`", line))?
            .to_owned();
        let members = columns
            .next()
            .with_context(|| format!("no population members in `{}`", line))?
            .split_whitespace()
            .map(|m| m.to_owned())
            .collect::<Vec<_>>();
        r.push((name, members));
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_maps_cover_internal_nodes() {
        let t = tree_from_string("((A,B)AB,C)ABC;").unwrap();
        let labels = label_map(&t);
        assert_eq!(labels.len(), 5);
        assert!(labels.contains_key("AB"));
        assert_eq!(leaf_labels(&t, labels["AB"]), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn unnamed_nodes_get_fresh_labels() {
        let t = tree_from_string("((A,B),(C,N0));").unwrap();
        let complete = complete_internal_labels(&t);
        let labels = label_map(&complete);
        assert_eq!(labels.len(), 7);
        // N0 is taken by a leaf; generated names must not collide
        assert_eq!(
            nodes(&complete)
                .iter()
                .filter(|&&n| complete.name(n).map(|s| s.to_owned()) == Some("N0".to_owned()))
                .count(),
            1
        );
    }

    #[test]
    fn restriction_collapses_single_child_chains() {
        let t = tree_from_string("(((A,B)AB,C)ABC,D)ABCD;").unwrap();
        let keep = HashSet::from_iter(["A".to_string(), "B".to_string()]);
        let restricted = restrict_to_leaves(&t, &keep);
        // the AB clade stands alone: chains above it are collapsed
        assert_eq!(
            restricted.name(restricted.root()).map(|s| s.to_owned()),
            Some("AB".to_owned())
        );
        assert_eq!(restricted.leaves().count(), 2);
    }

    #[test]
    fn populations_label_their_ancestor() {
        let t = tree_from_string("((A,B),C);").unwrap();
        let populations = vec![("AB".to_string(), vec!["A".to_string(), "B".to_string()])];
        let annotated = annotate_populations(&t, &populations).unwrap();
        assert!(label_map(&annotated).contains_key("AB"));
    }
}
