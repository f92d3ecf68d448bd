//! Membership string format
//!
//! Voting members render as `addr#W[S]`, learners as `addr$source`, vacated
//! slots as `0`. Items are `;` separated and a member string may end with
//! `@N`, the 1-based slot of the node that produced it.

use tracing::warn;

use super::member::{Member, DEFAULT_ELECTION_WEIGHT};
use crate::error::{Error, Result};

/// Rendering of a vacated slot
pub const NULL_SLOT: &str = "0";

/// One parsed item of a membership string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigItem {
    Null,
    Member {
        address: String,
        election_weight: u8,
        force_sync: bool,
    },
    Learner {
        address: String,
        source: u64,
    },
}

/// Split a membership string into items and the optional local position.
///
/// A `;` or `@` directly after `$` is a legacy one-character learner source,
/// not a separator.
pub fn split_items(input: &str) -> Result<(Vec<&str>, Option<u64>)> {
    let bytes = input.as_bytes();
    let mut items = Vec::new();
    let mut start = 0;

    for i in 0..bytes.len() {
        let b = bytes[i];
        if b != b';' && b != b'@' {
            continue;
        }
        if i > 0 && bytes[i - 1] == b'$' {
            continue;
        }

        if i > start {
            items.push(&input[start..i]);
        }
        start = i + 1;

        if b == b'@' {
            let local = &input[i + 1..];
            let position = local.parse::<u64>().map_err(|_| Error::MembershipParse {
                input: input.to_string(),
                reason: format!("bad local position {:?}", local),
            })?;
            return Ok((items, Some(position)));
        }
    }

    if start < bytes.len() {
        items.push(&input[start..]);
    }

    Ok((items, None))
}

/// Parse a single item
pub fn parse_item(item: &str) -> Result<ConfigItem> {
    if item == NULL_SLOT {
        return Ok(ConfigItem::Null);
    }

    if let Some(pos) = item.rfind('$') {
        let address = &item[..pos];
        if address.is_empty() {
            return Err(Error::MembershipParse {
                input: item.to_string(),
                reason: "empty learner address".into(),
            });
        }
        let source = parse_learner_source(item, &item[pos + 1..]);
        return Ok(ConfigItem::Learner {
            address: address.to_string(),
            source,
        });
    }

    let (address, election_weight, force_sync) = match item.rfind('#') {
        Some(pos) => {
            let (weight, force) = parse_member_suffix(item, &item[pos + 1..]);
            (&item[..pos], weight, force)
        }
        None => (item, DEFAULT_ELECTION_WEIGHT, false),
    };

    if address.is_empty() {
        return Err(Error::MembershipParse {
            input: item.to_string(),
            reason: "empty member address".into(),
        });
    }

    Ok(ConfigItem::Member {
        address: address.to_string(),
        election_weight,
        force_sync,
    })
}

/// Learner sources longer than three digits or containing non-digits are
/// reset to 0 (replicate from leader).
fn parse_learner_source(item: &str, source: &str) -> u64 {
    if source.is_empty() || source.len() > 3 || !source.bytes().all(|b| b.is_ascii_digit()) {
        warn!(
            "Learner {:?} has invalid source {:?}, replicating from leader instead",
            item, source
        );
        return 0;
    }
    source.parse().unwrap_or(0)
}

fn parse_member_suffix(item: &str, suffix: &str) -> (u8, bool) {
    let bytes = suffix.as_bytes();
    if bytes.is_empty() || bytes.len() > 2 {
        warn!(
            "Member {:?} has invalid suffix {:?}, using weight {}",
            item, suffix, DEFAULT_ELECTION_WEIGHT
        );
        return (DEFAULT_ELECTION_WEIGHT, false);
    }
    let force_sync = bytes[bytes.len() - 1] == b'S';
    let weight = if bytes[0].is_ascii_digit() {
        bytes[0] - b'0'
    } else {
        warn!(
            "Member {:?} has invalid weight {:?}, using weight {}",
            item, suffix, DEFAULT_ELECTION_WEIGHT
        );
        DEFAULT_ELECTION_WEIGHT
    };
    (weight, force_sync)
}

/// Render a voting member slot
pub fn member_to_string(member: Option<&Member>) -> String {
    match member {
        None => NULL_SLOT.to_string(),
        Some(m) => format!(
            "{}#{}{}",
            m.address,
            m.election_weight,
            if m.force_sync { "S" } else { "" }
        ),
    }
}

/// Render a learner slot
pub fn learner_to_string(learner: Option<&Member>) -> String {
    match learner {
        None => NULL_SLOT.to_string(),
        Some(l) => format!("{}${}", l.address, l.learner_source),
    }
}

/// Join rendered slots, appending `@local` when a local position is given
pub fn join_items<I>(items: I, local: Option<u64>) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut out = items.into_iter().collect::<Vec<_>>().join(";");
    if let Some(position) = local {
        out.push('@');
        out.push_str(&position.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_local() {
        let (items, local) = split_items("a:1#5;b:2#5S;c:3#9@1").unwrap();
        assert_eq!(items, vec!["a:1#5", "b:2#5S", "c:3#9"]);
        assert_eq!(local, Some(1));
    }

    #[test]
    fn test_split_skips_legacy_source_separator() {
        let (items, local) = split_items("a:1$;;b:2$@;c:3$0").unwrap();
        assert_eq!(items, vec!["a:1$;", "b:2$@", "c:3$0"]);
        assert_eq!(local, None);
    }

    #[test]
    fn test_parse_member_suffixes() {
        assert_eq!(
            parse_item("h:1#9S").unwrap(),
            ConfigItem::Member { address: "h:1".into(), election_weight: 9, force_sync: true }
        );
        assert_eq!(
            parse_item("h:1").unwrap(),
            ConfigItem::Member { address: "h:1".into(), election_weight: 5, force_sync: false }
        );
        // Too long: reset to defaults
        assert_eq!(
            parse_item("h:1#9SS").unwrap(),
            ConfigItem::Member { address: "h:1".into(), election_weight: 5, force_sync: false }
        );
        assert_eq!(parse_item("0").unwrap(), ConfigItem::Null);
    }

    #[test]
    fn test_member_suffix_without_weight() {
        assert_eq!(
            parse_item("h:1#S").unwrap(),
            ConfigItem::Member { address: "h:1".into(), election_weight: 5, force_sync: true }
        );
        assert_eq!(
            parse_item("h:1#6S").unwrap(),
            ConfigItem::Member { address: "h:1".into(), election_weight: 6, force_sync: true }
        );
        assert_eq!(
            parse_item("h:1#x").unwrap(),
            ConfigItem::Member { address: "h:1".into(), election_weight: 5, force_sync: false }
        );
    }

    #[test]
    fn test_lenient_learner_source_reset() {
        // Known leniency: malformed sources fall back to the leader instead of failing.
        assert_eq!(
            parse_item("h:1$1234").unwrap(),
            ConfigItem::Learner { address: "h:1".into(), source: 0 }
        );
        assert_eq!(
            parse_item("h:1$x").unwrap(),
            ConfigItem::Learner { address: "h:1".into(), source: 0 }
        );
        assert_eq!(
            parse_item("h:1$12").unwrap(),
            ConfigItem::Learner { address: "h:1".into(), source: 12 }
        );
    }

    #[test]
    fn test_bad_local_position() {
        assert!(split_items("a#5@x").is_err());
    }
}
