use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use either::Either;
use identity_hash::IntMap;
use log::debug;
use newick::{Newick, NewickTree, NodeID};

use crate::errors::RuntimeError;
use crate::events::Event;
use crate::utils::{label_map, leaf_labels, nodes, relabeled_copy};

pub type EventId = usize;

/// A recorded event: either the full tuple, or its dense id in the event
/// reference table.
pub type EventKey = Either<Event, EventId>;

pub struct SpeciesTranslation {
    /// A copy of the collapsed tree with internal nodes relabeled to their
    /// full-tree counterparts.
    pub tree: NewickTree,
    /// Collapsed label to full-tree label.
    pub labels: HashMap<String, String>,
}

/// Match the branches of a collapsed species tree with those of the full
/// reference tree.
///
/// Leaf labels are unchanged; every internal label maps to the label of the
/// smallest full-tree clade whose leaf set coalesces the collapsed node's
/// leaves.
pub fn translate_species_tree(
    collapsed: &NewickTree,
    reference: &NewickTree,
) -> Result<SpeciesTranslation> {
    let reference_labels = label_map(reference);
    let mut labels = HashMap::new();
    let mut renames = IntMap::<NodeID, String>::default();

    for n in nodes(collapsed) {
        let label = match collapsed.name(n) {
            Some(l) => l.to_owned(),
            None => continue,
        };
        if collapsed[n].is_leaf() {
            labels.insert(label.clone(), label);
        } else {
            let clade = leaf_labels(collapsed, n)
                .into_iter()
                .map(|l| {
                    reference_labels
                        .get(&l)
                        .copied()
                        .ok_or(RuntimeError::SpeciesNotFound(l))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let coalesced = reference
                .mrca(clade)
                .ok()
                .and_then(|m| reference.name(m))
                .with_context(|| format!("no labeled clade coalescing {}", label))?
                .to_owned();
            labels.insert(label, coalesced.clone());
            renames.insert(n, coalesced);
        }
    }

    Ok(SpeciesTranslation { tree: relabeled_copy(collapsed, &renames), labels })
}

/// Rewrite the location fields of a lineage's events from collapsed to full
/// species tree labels.
///
/// A transfer whose translated donor and recipient coincide was only
/// meaningful in the collapsed view and is dropped. With `reference`, each
/// translated tuple is replaced by its dense event id.
pub fn translate_events(
    events: &[Event],
    labels: &HashMap<String, String>,
    reference: Option<&EventRefDB>,
) -> Result<Vec<EventKey>> {
    let translate =
        |l: &String| labels.get(l).unwrap_or(l).to_owned();

    let mut r = Vec::with_capacity(events.len());
    for event in events.iter() {
        let translated = match event {
            Event::Duplication { location } => {
                Event::Duplication { location: translate(location) }
            }
            Event::Speciation { location } => {
                Event::Speciation { location: translate(location) }
            }
            Event::Loss { location } => Event::Loss { location: translate(location) },
            Event::Transfer { donor, recipient } => {
                let donor = translate(donor);
                let recipient = translate(recipient);
                if donor == recipient {
                    debug!("ignoring transfer nested in {}", donor);
                    continue;
                }
                Event::Transfer { donor, recipient }
            }
        };
        r.push(match reference {
            None => Either::Left(translated),
            Some(db) => Either::Right(db.id(&translated)?),
        });
    }
    Ok(r)
}

/// The enumeration of every realizable event on the full reference tree,
/// mapping event tuples to dense integer ids for compact storage.
pub struct EventRefDB {
    tup2id: HashMap<Event, EventId>,
    id2tup: Vec<Event>,
}

impl EventRefDB {
    pub fn id(&self, event: &Event) -> Result<EventId, RuntimeError> {
        self.tup2id.get(event).copied().ok_or_else(|| {
            RuntimeError::UnknownEvent(format!(
                "{}:{}",
                event.kind(),
                event.locations().join("->")
            ))
        })
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.id2tup.get(id)
    }

    pub fn len(&self) -> usize {
        self.id2tup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2tup.is_empty()
    }
}

/// Enumerate every event realizable on the reference tree: per node, one
/// duplication, loss and speciation, plus one transfer per ordered
/// (donor, recipient) pair of distinct nodes.
///
/// With `tables_dir`, the tree and the enumeration are dumped as
/// tab-separated tables.
pub fn generate_event_db(reference: &NewickTree, tables_dir: Option<&Path>) -> Result<EventRefDB> {
    let all = nodes(reference);
    let named = all
        .iter()
        .map(|&n| {
            reference
                .name(n)
                .map(|l| (n, l.to_owned()))
                .with_context(|| format!("unnamed node #{} in the reference species tree", n))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut tree_table = match tables_dir {
        Some(dir) => Some(BufWriter::new(File::create(
            dir.join("phylogeny_species_tree.tab"),
        )?)),
        None => None,
    };
    let mut events_table = match tables_dir {
        Some(dir) => Some(BufWriter::new(File::create(
            dir.join("phylogeny_species_tree_events.tab"),
        )?)),
        None => None,
    };

    let mut tup2id = HashMap::new();
    let mut id2tup = Vec::new();
    let mut record = |event: Event,
                      donor: Option<NodeID>,
                      recipient: NodeID,
                      out: &mut Option<BufWriter<File>>|
     -> Result<()> {
        let id = id2tup.len();
        if let Some(ref mut out) = out {
            writeln!(
                out,
                "{}\t{}\t{}\t{}",
                id,
                event.kind(),
                donor.map(|d| d.to_string()).unwrap_or_default(),
                recipient
            )?;
        }
        tup2id.insert(event.clone(), id);
        id2tup.push(event);
        Ok(())
    };

    for (n, label) in named.iter() {
        if let Some(ref mut out) = tree_table {
            writeln!(
                out,
                "{}\t{}\t{}\t{}",
                n,
                reference.parent(*n).map(|p| p.to_string()).unwrap_or_default(),
                label,
                u8::from(reference[*n].is_leaf())
            )?;
        }
        record(Event::Duplication { location: label.clone() }, None, *n, &mut events_table)?;
        for (donor, donor_label) in named.iter() {
            if donor != n {
                record(
                    Event::Transfer { donor: donor_label.clone(), recipient: label.clone() },
                    Some(*donor),
                    *n,
                    &mut events_table,
                )?;
            }
        }
        record(Event::Loss { location: label.clone() }, None, *n, &mut events_table)?;
        record(Event::Speciation { location: label.clone() }, None, *n, &mut events_table)?;
    }

    if let Some(mut out) = tree_table {
        out.flush()?;
    }
    if let Some(mut out) = events_table {
        out.flush()?;
    }

    Ok(EventRefDB { tup2id, id2tup })
}
