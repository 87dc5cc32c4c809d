//! Child-class matching: decomposing an entry's name into entries of the
//! child classes its class declares.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::access::vector::AccessVector;
use crate::errors::CradleResult;
use crate::jobs::policy::JobKind;
use crate::jobs::queue::JobQueue;
use crate::models::{ClassFormat, ContentRef, Entry, EntryClass, RelationReason};
use crate::store::records::{
    class_children, content_vector, create_relation, delete_relations_owned_by, get_entries,
    get_entry, get_or_create_entry, relations_owned_by, NewRelation,
};

fn on_token_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    !before.is_some_and(is_word) && !after.is_some_and(is_word)
}

impl EntryClass {
    /// Candidate child names found in `text`, in order of first occurrence.
    ///
    /// Regex classes yield every non-empty capture group of every match, or
    /// the whole match when the pattern has no groups. Option classes yield
    /// every option occurring in `text` on token boundaries.
    pub fn match_text(&self, text: &str) -> CradleResult<Vec<String>> {
        let mut found: Vec<String> = Vec::new();
        match &self.format {
            Some(ClassFormat::Regex(pattern)) => {
                let re = Regex::new(pattern)?;
                for caps in re.captures_iter(text) {
                    if caps.len() > 1 {
                        found.extend(
                            caps.iter()
                                .skip(1)
                                .flatten()
                                .map(|m| m.as_str())
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                        );
                    } else if let Some(m) = caps.get(0).filter(|m| !m.as_str().is_empty()) {
                        found.push(m.as_str().to_string());
                    }
                }
            }
            Some(ClassFormat::Options(options)) => {
                let mut hits: Vec<(usize, &String)> = options
                    .iter()
                    .filter(|o| !o.is_empty())
                    .filter_map(|option| {
                        text.match_indices(option.as_str())
                            .find(|(start, _)| on_token_boundary(text, *start, start + option.len()))
                            .map(|(start, _)| (start, option))
                    })
                    .collect();
                hits.sort();
                found.extend(hits.into_iter().map(|(_, o)| o.clone()));
            }
            None => {}
        }
        let mut seen = BTreeSet::new();
        found.retain(|name| seen.insert(name.clone()));
        Ok(found)
    }

    /// Whether `text` is a valid name for this class: a full regex match,
    /// one of the options, or anything when the class has no format.
    pub fn validate_text(&self, text: &str) -> CradleResult<bool> {
        Ok(match &self.format {
            Some(ClassFormat::Regex(pattern)) => {
                Regex::new(&format!("^(?:{pattern})$"))?.is_match(text)
            }
            Some(ClassFormat::Options(options)) => options.iter().any(|o| o == text),
            None => true,
        })
    }
}

/// A child entry resolved from a parent's name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChildMatch {
    pub entry: Entry,
    pub class: EntryClass,
    /// True when the entry did not exist before this resolution.
    pub created: bool,
}

/// Pure matching step: `(parent index, child class, child name)` triples.
fn match_children(
    parents: &[Entry],
    children_by_class: &HashMap<i64, Vec<EntryClass>>,
) -> Vec<(usize, EntryClass, String)> {
    parents
        .par_iter()
        .enumerate()
        .flat_map_iter(|(idx, parent)| {
            let classes = children_by_class
                .get(&parent.class_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let mut out = Vec::new();
            for class in classes {
                match class.match_text(&parent.name) {
                    Ok(names) => {
                        out.extend(names.into_iter().map(|name| (idx, class.clone(), name)))
                    }
                    Err(e) => warn!("class {} has an unusable pattern: {e}", class.subtype),
                }
            }
            out
        })
        .collect()
}

fn child_classes_for(
    conn: &Connection,
    parents: &[Entry],
) -> CradleResult<HashMap<i64, Vec<EntryClass>>> {
    let mut by_class = HashMap::new();
    for parent in parents {
        if !by_class.contains_key(&parent.class_id) {
            by_class.insert(parent.class_id, class_children(conn, parent.class_id)?);
        }
    }
    Ok(by_class)
}

/// Get-or-create the children named inside `entry_id`'s name.
pub fn resolve_children(conn: &Connection, entry_id: i64) -> CradleResult<Vec<ChildMatch>> {
    let parent = get_entry(conn, entry_id)?;
    let parents = [parent];
    let by_class = child_classes_for(conn, &parents)?;
    let mut resolved: Vec<ChildMatch> = Vec::new();
    for (_, class, name) in match_children(&parents, &by_class) {
        let (entry, created) = get_or_create_entry(conn, class.id, &name)?;
        if entry.id == entry_id || resolved.iter().any(|m| m.entry.id == entry.id) {
            continue;
        }
        resolved.push(ChildMatch {
            entry,
            class,
            created,
        });
    }
    Ok(resolved)
}

/// Summary of one child scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub relations_removed: usize,
    pub relations_created: usize,
    pub entries_created: usize,
    /// Children that gained or lost an inherited parent in this scan.
    pub inheritance_changed: Vec<i64>,
}

impl ScanReport {
    pub fn created_any(&self) -> bool {
        self.entries_created > 0
    }
}

/// Rebuild the CONTAINS relations `content` owns for the given entries.
///
/// Previously owned CONTAINS relations are dropped first, so rescanning the
/// same entries yields the same relation set. Each new relation points from
/// child to parent, inherits access vectors and starts with the content's
/// vector. Children whose set of inherited parents changed get an
/// `UpdateAccesses` job in the same transaction.
pub fn scan_for_children(
    conn: &Connection,
    queue: &dyn JobQueue,
    entry_ids: &[i64],
    content: &ContentRef,
) -> CradleResult<ScanReport> {
    let parents = get_entries(conn, entry_ids)?;
    let by_class = child_classes_for(conn, &parents)?;
    let matches = match_children(&parents, &by_class);

    let vector = if content.carries_vector() {
        content_vector(conn, content)?
    } else {
        AccessVector::default_vector()
    };

    let mut report = ScanReport::default();
    let tx = conn.unchecked_transaction()?;
    let before: BTreeSet<(i64, i64)> = relations_owned_by(&tx, content)?
        .into_iter()
        .filter(|r| r.reason == RelationReason::Contains && r.inherit_av)
        .map(|r| (r.e1, r.e2))
        .collect();
    let mut after: BTreeSet<(i64, i64)> = BTreeSet::new();
    report.relations_removed = delete_relations_owned_by(&tx, content, RelationReason::Contains)?;
    for (idx, class, name) in matches {
        let parent = &parents[idx];
        let (child, created) = get_or_create_entry(&tx, class.id, &name)?;
        if child.id == parent.id {
            continue;
        }
        if created {
            report.entries_created += 1;
        }
        let (_, inserted) = create_relation(
            &tx,
            &NewRelation {
                e1: child.id,
                e2: parent.id,
                reason: RelationReason::Contains,
                inherit_av: true,
                access_vector: vector.clone(),
                owner: Some(content.clone()),
            },
        )?;
        if inserted {
            report.relations_created += 1;
        }
        after.insert((child.id, parent.id));
    }
    let changed: BTreeSet<i64> = before
        .symmetric_difference(&after)
        .map(|(child, _)| *child)
        .collect();
    for entry_id in &changed {
        queue.submit(JobKind::UpdateAccesses { entry_id: *entry_id })?;
    }
    report.inheritance_changed = changed.into_iter().collect();
    tx.commit()?;
    debug!(
        "child scan for {content}: {} removed, {} created, {} new entries",
        report.relations_removed, report.relations_created, report.entries_created
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::MemoryJobQueue;
    use crate::models::EntryType;
    use crate::store::records::{
        add_class_child, create_content, create_entry, create_entry_class, relations_owned_by,
    };
    use crate::store::schema::open_in_memory;

    fn class(format: Option<ClassFormat>) -> EntryClass {
        EntryClass {
            id: 1,
            subtype: "t".into(),
            entry_type: EntryType::Artifact,
            format,
        }
    }

    #[test]
    fn test_regex_groups_and_whole_match() {
        let grouped = class(Some(ClassFormat::Regex(r":(\d+)".into())));
        assert_eq!(
            grouped.match_text("10.0.0.1:443 and 10.0.0.2:8080").unwrap(),
            vec!["443", "8080"]
        );
        let whole = class(Some(ClassFormat::Regex(r"\d+\.\d+\.\d+\.\d+".into())));
        assert_eq!(
            whole.match_text("10.0.0.1:443").unwrap(),
            vec!["10.0.0.1"]
        );
    }

    #[test]
    fn test_options_respect_token_boundaries() {
        let protocols = class(Some(ClassFormat::Options(vec![
            "tcp".into(),
            "udp".into(),
            "http".into(),
        ])));
        assert_eq!(
            protocols.match_text("udp/53 over tcp, not https").unwrap(),
            vec!["udp", "tcp"]
        );
    }

    #[test]
    fn test_validate_text() {
        let port = class(Some(ClassFormat::Regex(r"\d{1,5}".into())));
        assert!(port.validate_text("8080").unwrap());
        assert!(!port.validate_text("8080x").unwrap());
        let proto = class(Some(ClassFormat::Options(vec!["tcp".into()])));
        assert!(proto.validate_text("tcp").unwrap());
        assert!(!proto.validate_text("tcp6").unwrap());
        assert!(class(None).validate_text("anything").unwrap());
    }

    #[test]
    fn test_rescan_does_not_duplicate_relations() {
        let conn = open_in_memory().unwrap();
        let socket = create_entry_class(&conn, "socket", EntryType::Artifact, None).unwrap();
        let port = create_entry_class(
            &conn,
            "port",
            EntryType::Artifact,
            Some(&ClassFormat::Regex(r":(\d+)$".into())),
        )
        .unwrap();
        add_class_child(&conn, socket.id, port.id).unwrap();
        let parent = create_entry(&conn, socket.id, "10.0.0.1:443", None).unwrap();
        let note = create_content(&conn, "note").unwrap();

        let queue = MemoryJobQueue::default();
        let first = scan_for_children(&conn, &queue, &[parent.id], &note).unwrap();
        let second = scan_for_children(&conn, &queue, &[parent.id], &note).unwrap();

        assert_eq!(first.entries_created, 1);
        assert!(first.created_any());
        assert_eq!(second.entries_created, 0);
        assert_eq!(second.relations_removed, 1);
        let owned = relations_owned_by(&conn, &note).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].e2, parent.id);
        assert!(owned[0].inherit_av);
        assert_eq!(owned[0].reason, RelationReason::Contains);

        // Only the first scan changed what the port inherits from.
        assert_eq!(first.inheritance_changed, vec![owned[0].e1]);
        assert!(second.inheritance_changed.is_empty());
        assert_eq!(queue.jobs().len(), 1);
        assert_eq!(
            queue.pending_jobs(),
            vec![JobKind::UpdateAccesses { entry_id: owned[0].e1 }]
        );
    }

    #[test]
    fn test_rescan_of_a_renamed_parent_updates_the_dropped_child() {
        let conn = open_in_memory().unwrap();
        let socket = create_entry_class(&conn, "socket", EntryType::Artifact, None).unwrap();
        let port = create_entry_class(
            &conn,
            "port",
            EntryType::Artifact,
            Some(&ClassFormat::Regex(r":(\d+)$".into())),
        )
        .unwrap();
        add_class_child(&conn, socket.id, port.id).unwrap();
        let parent = create_entry(&conn, socket.id, "10.0.0.1:443", None).unwrap();
        let note = create_content(&conn, "note").unwrap();
        let queue = MemoryJobQueue::default();
        let first = scan_for_children(&conn, &queue, &[parent.id], &note).unwrap();

        conn.execute(
            "UPDATE entries SET name = '10.0.0.1:8443' WHERE id = ?1;",
            rusqlite::params![parent.id],
        )
        .unwrap();
        let second = scan_for_children(&conn, &queue, &[parent.id], &note).unwrap();

        let old_port = first.inheritance_changed[0];
        let new_port = relations_owned_by(&conn, &note).unwrap()[0].e1;
        assert_ne!(old_port, new_port);
        let mut expected = vec![old_port, new_port];
        expected.sort();
        assert_eq!(second.inheritance_changed, expected);
    }

    #[test]
    fn test_resolve_children_reports_existing_entries() {
        let conn = open_in_memory().unwrap();
        let socket = create_entry_class(&conn, "socket", EntryType::Artifact, None).unwrap();
        let port = create_entry_class(
            &conn,
            "port",
            EntryType::Artifact,
            Some(&ClassFormat::Regex(r":(\d+)$".into())),
        )
        .unwrap();
        add_class_child(&conn, socket.id, port.id).unwrap();
        let parent = create_entry(&conn, socket.id, "host:22", None).unwrap();

        let first = resolve_children(&conn, parent.id).unwrap();
        let again = resolve_children(&conn, parent.id).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].created);
        assert_eq!(first[0].entry.name, "22");
        assert!(!again[0].created);
        assert_eq!(first[0].entry.id, again[0].entry.id);
    }
}
