use std::collections::HashMap;

use anyhow::{bail, Result};
use identity_hash::IntMap;
use newick::{Newick, NewickTree, NodeID};
use regex::Regex;

use crate::errors::{GrammarError, RecParseError, RuntimeError};
use crate::events::{decode_token, token_species, Event, EventKinds, FrequencyCache, Token};
use crate::utils::nodes;

/// Events occurring on the lineage segment ending at each gene tree node,
/// in chronological (rootward) order as encoded in the node label.
pub type PerNodeEvents = IntMap<NodeID, Vec<Event>>;

pub struct DecodeOptions<'a> {
    pub kinds: EventKinds,
    /// Separator between species label and gene copy suffix in leaf names.
    pub separator: char,
    /// If non-empty, only duplications, transfers and losses located on
    /// these labels are recorded.
    pub restricted_labels: &'a [String],
}

fn allowed(restricted: &[String], locations: &[&str]) -> bool {
    restricted.is_empty() || locations.iter().all(|l| restricted.iter().any(|r| r == l))
}

/// Decode the lineage history string of every node of one reconciled gene
/// tree, as found in the output of ALEml_undated.
///
/// Event frequencies are counted over the whole raw tree sample on first
/// encounter of each event identity and cached in `frequencies`.
pub fn decode_gene_tree(
    recgt: &NewickTree,
    species_tree: &NewickTree,
    species_labels: &HashMap<String, NodeID>,
    frequencies: &mut FrequencyCache,
    sample: &str,
    nsample: usize,
    options: &DecodeOptions,
) -> Result<PerNodeEvents> {
    let mut r = PerNodeEvents::default();

    for n in nodes(recgt) {
        let label =
            recgt.name(n).map(|l| l.to_owned()).ok_or(RecParseError::UnannotatedNode(n))?;
        // events on the lineage, to be read left-to-right backward in time
        let lineage = label.split('.').collect::<Vec<_>>();
        for i in 1..lineage.len() {
            let token = lineage[i];
            let previous = lineage[i - 1];
            match decode_token(token)? {
                Token::Duplication(location) => {
                    if options.kinds.duplications {
                        let event = Event::Duplication { location: location.to_owned() };
                        frequencies.observe(&event, token, sample, nsample);
                        if allowed(options.restricted_labels, &[location]) {
                            r.entry(n).or_default().push(event);
                        }
                    }
                }
                Token::Transfer { donor, recipient } => {
                    if options.kinds.transfers {
                        let event = Event::Transfer {
                            donor: donor.to_owned(),
                            recipient: recipient.to_owned(),
                        };
                        frequencies.observe(&event, token, sample, nsample);
                        if allowed(options.restricted_labels, &[donor, recipient]) {
                            r.entry(n).or_default().push(event);
                        }
                    }
                }
                Token::Species(_) => {
                    if options.kinds.speciations {
                        let species = token_species(token, options.separator);
                        let event = Event::Speciation { location: species.to_owned() };
                        frequencies.observe(&event, token, sample, nsample);
                        r.entry(n).or_default().push(event);
                    }
                    if !previous.is_empty() && options.kinds.losses {
                        // the speciation occurs at the named node, but the
                        // loss occurred in the child clade not found
                        // downstream on this lineage
                        let split = *species_labels
                            .get(token)
                            .ok_or_else(|| RuntimeError::SpeciesNotFound(token.to_owned()))?;
                        let surviving = token_species(previous, options.separator);
                        let mut children = species_tree
                            .children(split)
                            .unwrap()
                            .iter()
                            .filter_map(|&c| species_tree.name(c).map(|l| l.to_owned()))
                            .collect::<Vec<_>>();
                        children.retain(|c| c != surviving);
                        if children.len() != 1 {
                            bail!(GrammarError::NonBinaryNode {
                                node: token.to_owned(),
                                children,
                            });
                        }
                        let lost = children.pop().unwrap();
                        let event = Event::Loss { location: lost.clone() };
                        frequencies.observe(&event, token, sample, nsample);
                        if allowed(options.restricted_labels, &[lost.as_str()]) {
                            r.entry(n).or_default().push(event);
                        }
                    }
                }
            }
        }
    }

    Ok(r)
}

/// Root-ward dynamic programming over one gene tree: a node's full event
/// path is its own events followed by its parent's already-computed path.
///
/// The memo table guarantees each node is resolved once per tree, however
/// many leaves share it.
#[derive(Default)]
pub struct LineageAccumulator {
    memo: IntMap<NodeID, Vec<Event>>,
    computed: usize,
}

impl LineageAccumulator {
    pub fn new() -> Self {
        Default::default()
    }

    /// How many node paths were actually computed (cache misses).
    pub fn computed(&self) -> usize {
        self.computed
    }

    fn walk(&mut self, t: &NewickTree, events: &PerNodeEvents, n: NodeID) -> Vec<Event> {
        if let Some(path) = self.memo.get(&n) {
            return path.clone();
        }
        self.computed += 1;
        let mut path = events.get(&n).cloned().unwrap_or_default();
        if let Some(parent) = t.parent(n) {
            path.extend(self.walk(t, events, parent));
        }
        self.memo.insert(n, path.clone());
        path
    }

    /// The ordered event path from every retained leaf to the root, keyed by
    /// the leaf's own identity token.
    ///
    /// `only` restricts to the given gene labels; `dedup` collapses leaves
    /// sharing the same captured tag onto the first one encountered.
    pub fn lineages(
        &mut self,
        t: &NewickTree,
        events: &PerNodeEvents,
        only: &[String],
        dedup: Option<&Regex>,
    ) -> Result<HashMap<String, Vec<Event>>> {
        let mut leaves = Vec::new();
        for l in t.leaves().collect::<Vec<_>>() {
            let label =
                t.name(l).map(|s| s.to_owned()).ok_or(RecParseError::UnannotatedNode(l))?;
            let gene = label.split('.').next().unwrap().to_owned();
            if only.is_empty() || only.iter().any(|o| *o == gene) {
                leaves.push((l, gene));
            }
        }

        if let Some(pattern) = dedup {
            let mut seen = std::collections::HashSet::new();
            leaves.retain(|(_, gene)| match pattern.captures(gene) {
                Some(m) => {
                    let tag = m.get(1).unwrap_or_else(|| m.get(0).unwrap()).as_str().to_owned();
                    seen.insert(tag)
                }
                None => true,
            });
        }

        Ok(leaves
            .into_iter()
            .map(|(l, gene)| (gene, self.walk(t, events, l)))
            .collect())
    }
}
