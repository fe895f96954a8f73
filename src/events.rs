use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Error, Result};

use crate::errors::GrammarError;

/// Default separator between a species label and the gene copy suffix in
/// gene tree leaf names, e.g. `ESCCOL_01234`.
pub const DEFAULT_SEPARATOR: char = '_';

/// A single reconciliation event, located on the species tree it was
/// inferred against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {
    Duplication { location: String },
    Transfer { donor: String, recipient: String },
    Speciation { location: String },
    Loss { location: String },
}

impl Event {
    pub fn kind(&self) -> char {
        match self {
            Event::Duplication { .. } => 'D',
            Event::Transfer { .. } => 'T',
            Event::Speciation { .. } => 'S',
            Event::Loss { .. } => 'L',
        }
    }

    /// The location labels, donor first for transfers.
    pub fn locations(&self) -> Vec<&str> {
        match self {
            Event::Duplication { location }
            | Event::Speciation { location }
            | Event::Loss { location } => vec![location],
            Event::Transfer { donor, recipient } => vec![donor, recipient],
        }
    }

    /// Re-encode the location fields as they appear in lineage history
    /// strings.
    pub fn marker(&self) -> String {
        match self {
            Event::Duplication { location } => format!("D@{}", location),
            Event::Transfer { donor, recipient } => format!("T@{}->{}", donor, recipient),
            Event::Speciation { location } | Event::Loss { location } => location.clone(),
        }
    }
}

/// One token of a `.`-separated lineage history string, classified but not
/// yet resolved against the species tree.
#[derive(Debug, PartialEq, Eq)]
pub enum Token<'a> {
    Duplication(&'a str),
    Transfer { donor: &'a str, recipient: &'a str },
    /// A bare species tree node label, denoting an implicit speciation.
    Species(&'a str),
}

pub fn decode_token(token: &str) -> Result<Token, GrammarError> {
    if let Some(location) = token.strip_prefix("D@") {
        Ok(Token::Duplication(location))
    } else if let Some(direction) = token.strip_prefix("T@") {
        let mut ends = direction.split("->");
        match (ends.next(), ends.next(), ends.next()) {
            (Some(donor), Some(recipient), None) => Ok(Token::Transfer { donor, recipient }),
            _ => Err(GrammarError::MalformedTransfer(token.to_owned())),
        }
    } else {
        Ok(Token::Species(token))
    }
}

/// Canonical species tree label of a token: the part after the `@` marker if
/// any, then the part before the `->` marker if any, shorn of the gene copy
/// suffix.
pub fn token_species(token: &str, separator: char) -> &str {
    let label = token.split('@').nth(1).unwrap_or(token);
    let label = label.split("->").next().unwrap();
    label.split(separator).next().unwrap()
}

/// Which event kinds to extract from the reconciled gene trees.
#[derive(Debug, Clone, Copy)]
pub struct EventKinds {
    pub duplications: bool,
    pub transfers: bool,
    pub losses: bool,
    pub speciations: bool,
}

impl std::str::FromStr for EventKinds {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut kinds = EventKinds {
            duplications: false,
            transfers: false,
            losses: false,
            speciations: false,
        };
        for c in s.chars() {
            match c {
                'D' => kinds.duplications = true,
                'T' => kinds.transfers = true,
                'L' => kinds.losses = true,
                'S' => kinds.speciations = true,
                _ => bail!("unknown event kind `{}` in `{}`; expected a subset of DTLS", c, s),
            }
        }
        Ok(kinds)
    }
}

impl fmt::Display for EventKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (on, c) in [
            (self.duplications, 'D'),
            (self.transfers, 'T'),
            (self.losses, 'L'),
            (self.speciations, 'S'),
        ] {
            if on {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Sample-wide event frequencies, counted by literal pattern matching over
/// the concatenated raw gene tree sample.
///
/// Counts are not differentiated by lineage: the same transfer occurring in
/// two paralogous lineages of one tree counts twice. Each identity is counted
/// once per reconciliation file, on first encounter, then cached.
#[derive(Debug, Default)]
pub struct FrequencyCache {
    frequencies: HashMap<Event, f64>,
}

impl FrequencyCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Frequency of `event`, whose raw marker text was `token`, in a sample
    /// of `nsample` trees concatenated in `sample`.
    pub fn observe(&mut self, event: &Event, token: &str, sample: &str, nsample: usize) -> f64 {
        if let Some(&f) = self.frequencies.get(event) {
            return f;
        }
        let count = match event {
            // D and T markers are unambiguous; a literal count suffices.
            Event::Duplication { .. } | Event::Transfer { .. } => sample.matches(token).count(),
            Event::Speciation { .. } => count_speciations(sample, token),
            Event::Loss { .. } => count_losses(sample, token),
        };
        let f = count as f64 / nsample as f64;
        self.frequencies.insert(event.clone(), f);
        f
    }

    pub fn frequencies(&self) -> &HashMap<Event, f64> {
        &self.frequencies
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }
}

/// Occurrences of a speciation at an internal node or a leaf: the node label
/// preceded by `.`, `(` or `,`.
fn count_speciations(sample: &str, token: &str) -> usize {
    sample
        .match_indices(token)
        .filter(|(i, _)| {
            i.checked_sub(1)
                .map(|p| matches!(sample.as_bytes()[p], b'.' | b'(' | b','))
                .unwrap_or(false)
        })
        .count()
}

/// Occurrences of a speciation-loss: the split node label preceded by `.`,
/// itself not closing a subtree.
fn count_losses(sample: &str, token: &str) -> usize {
    sample
        .match_indices(token)
        .filter(|(i, _)| {
            i.checked_sub(2)
                .map(|p| sample.as_bytes()[p] != b')' && sample.as_bytes()[p + 1] == b'.')
                .unwrap_or(false)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_decode_and_reencode() {
        let dup = decode_token("D@ABC").unwrap();
        assert_eq!(dup, Token::Duplication("ABC"));
        assert_eq!(Event::Duplication { location: "ABC".into() }.marker(), "D@ABC");

        let transfer = decode_token("T@A->B").unwrap();
        assert_eq!(transfer, Token::Transfer { donor: "A", recipient: "B" });
        assert_eq!(
            Event::Transfer { donor: "A".into(), recipient: "B".into() }.marker(),
            "T@A->B"
        );

        let spe = decode_token("ESCCOL_01234").unwrap();
        assert_eq!(spe, Token::Species("ESCCOL_01234"));
        assert_eq!(Event::Speciation { location: "ESCCOL".into() }.marker(), "ESCCOL");
        assert_eq!(Event::Loss { location: "ESCCOL".into() }.marker(), "ESCCOL");
    }

    #[test]
    fn transfer_tokens_must_have_two_ends() {
        assert!(matches!(
            decode_token("T@AB"),
            Err(GrammarError::MalformedTransfer(_))
        ));
        assert!(matches!(
            decode_token("T@A->B->C"),
            Err(GrammarError::MalformedTransfer(_))
        ));
    }

    #[test]
    fn species_labels_are_canonicalized() {
        assert_eq!(token_species("ESCCOL_01234", '_'), "ESCCOL");
        assert_eq!(token_species("T@A->B", '_'), "A");
        assert_eq!(token_species("D@ABC", '_'), "ABC");
        assert_eq!(token_species("ABC", '_'), "ABC");
    }

    #[test]
    fn kinds_parse_and_display() {
        let kinds: EventKinds = "DTS".parse().unwrap();
        assert!(kinds.duplications && kinds.transfers && kinds.speciations);
        assert!(!kinds.losses);
        assert_eq!(kinds.to_string(), "DTS");
        assert!("DTX".parse::<EventKinds>().is_err());
    }

    #[test]
    fn frequencies_are_counted_once_then_cached() {
        let mut cache = FrequencyCache::new();
        let dup = Event::Duplication { location: "ABC".into() };
        let sample = "(a.D@ABC,b)x;\n(a.D@ABC,b)x;\n";
        assert_eq!(cache.observe(&dup, "D@ABC", sample, 2), 1.0);
        // a different sample must not invalidate the cached value
        assert_eq!(cache.observe(&dup, "D@ABC", "", 2), 1.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn speciation_counts_require_a_leading_marker() {
        // one occurrence after `(`, one after `.`, none at string start
        let sample = "(ABC.x,y.ABC)z;";
        assert_eq!(count_speciations(sample, "ABC"), 2);
        assert_eq!(count_speciations("ABC.x", "ABC"), 0);
    }

    #[test]
    fn loss_counts_skip_subtree_closings() {
        let sample = "(x.ABC,(y,z).ABC)w;";
        // `x.ABC` qualifies; `).ABC` does not
        assert_eq!(count_losses(sample, "ABC"), 1);
    }
}
