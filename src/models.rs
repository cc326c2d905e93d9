//! Core data types flowing through Dispatch.
//!
//! The lifecycle, roughly:
//!
//! ```text
//! Site Registry → Wiki ─┬─ action API → Revision (expander, store)
//!                       └─ replica SQL → DeletedRevision / DeletedPage
//! ```
//!
//! A [`Revision`] is either fully expanded or explicitly missing, never
//! partial. Deletion attribution is a sum over "the replicas scrubbed the
//! cause" ([`Deleted::Suppressed`]) and "this log entry most likely caused
//! it" ([`Deleted::Entry`]).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};

/// One logical wiki from the site catalogue. Immutable after fetch; a
/// registry refresh replaces the whole set atomically.
#[derive(Debug, Clone, Serialize)]
pub struct Wiki {
    /// Database name, e.g. `"enwiki"`. The primary lookup key.
    pub dbname: String,
    /// Base URL, e.g. `"https://en.wikipedia.org"`.
    pub url: String,
    /// Language code, e.g. `"en"`; `"special"` for non-language sites.
    pub lang: String,
    /// Readable only with an account.
    pub private: bool,
    /// No longer accepts edits.
    pub closed: bool,
    /// Readable but editable only by approved users.
    pub fishbowl: bool,
    /// Excluded from the global authentication pool; such wikis are not
    /// served by this tool.
    pub nonglobal: bool,
}

impl Wiki {
    /// Hostname component of the base URL, used by the origin index.
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .unwrap_or(&self.url);
        rest.split('/').next().unwrap_or(rest)
    }

    /// Action API endpoint for this wiki.
    pub fn api_url(&self) -> String {
        format!("{}/w/api.php", self.url)
    }
}

/// Per-wiki namespace descriptor, fetched once with the legal-title
/// character set and cached indefinitely.
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub id: i64,
    /// English canonical name (`"User talk"`); empty for the main namespace.
    pub canonical: String,
    /// Localized name as the wiki renders it (`"Benutzer Diskussion"`).
    pub localized: String,
    /// `true` when titles keep their case (`case == "case-sensitive"`).
    pub case_sensitive: bool,
    pub content: bool,
    pub subpages: bool,
    /// Namespace-wide read right, when restricted.
    pub right: Option<String>,
}

/// The page a revision belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRef {
    pub pageid: u64,
    #[serde(rename = "ns")]
    pub namespace: i64,
    /// Prefixed title, e.g. `"User talk:Example"`.
    pub title: String,
}

/// Which of a revision's fields are hidden from public view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VisibilityFlags {
    pub user: bool,
    pub comment: bool,
    pub text: bool,
}

/// A fully expanded revision as served by `/v1/revisions`.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionData {
    pub revid: u64,
    pub parentid: u64,
    pub minor: bool,
    /// `None` when the user field is hidden.
    pub user: Option<String>,
    /// ISO-8601 UTC; `None` when hidden.
    pub timestamp: Option<DateTime<Utc>>,
    pub size: i64,
    /// `None` when the comment field is hidden.
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsedcomment: Option<String>,
    pub tags: Vec<String>,
    pub page: PageRef,
    /// `size − parent.size`; absent while the parent size is unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diffsize: Option<i64>,
    /// Hidden-field flags as reported by the API.
    pub hidden: VisibilityFlags,
    /// Snapshot attached by a visibility-change event, when one has been
    /// applied since the revision was stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<VisibilityFlags>,
}

/// Marker for an id the upstream does not know.
#[derive(Debug, Clone, Serialize)]
pub struct MissingRevision {
    pub revid: u64,
    pub missing: bool,
}

/// The revision sum type: either complete or explicitly missing.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Revision {
    Live(RevisionData),
    Missing(MissingRevision),
}

impl Revision {
    pub fn missing(revid: u64) -> Self {
        Revision::Missing(MissingRevision {
            revid,
            missing: true,
        })
    }

    pub fn revid(&self) -> u64 {
        match self {
            Revision::Live(data) => data.revid,
            Revision::Missing(missing) => missing.revid,
        }
    }
}

/// Four-bit deletion mask decoded into named flags.
///
/// Bit 0 hides the content, bit 1 the comment, bit 2 the user; bit 3 marks
/// suppression (visible only to oversighters).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionFlags {
    pub content: bool,
    pub comment: bool,
    pub user: bool,
    pub restricted: bool,
}

impl DeletionFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            content: bits & 1 != 0,
            comment: bits & 2 != 0,
            user: bits & 4 != 0,
            restricted: bits & 8 != 0,
        }
    }
}

/// Decoded `log_params` of a `delete/revision` log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionParams {
    /// Target kind, normally `"revision"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Revision ids named by the entry.
    pub ids: Vec<u64>,
    /// Visibility bits before the action.
    pub old: DeletionFlags,
    /// Visibility bits after the action.
    pub new: DeletionFlags,
}

/// A deletion log row joined from the replica.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub logid: u64,
    pub timestamp: Option<DateTime<Utc>>,
    /// `None` when the actor field of the log row is hidden.
    pub actor: Option<String>,
    pub comment: Option<String>,
    pub tags: Vec<String>,
    pub params: DeletionParams,
}

/// Attribution of a revision-level deletion.
#[derive(Debug, Clone)]
pub enum Deleted {
    /// Suppressed, or the replicas have lost the causal log row.
    Suppressed,
    /// The log entry most likely responsible.
    Entry {
        entry: LogEntry,
        /// Heuristic: the revid is among the entry's three smallest ids,
        /// where batch deletions typically name their primary targets.
        islikelycause: bool,
    },
}

impl Serialize for Deleted {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Deleted::Suppressed => serializer.serialize_bool(true),
            Deleted::Entry {
                entry,
                islikelycause,
            } => {
                #[derive(Serialize)]
                struct Attributed<'a> {
                    #[serde(flatten)]
                    entry: &'a LogEntry,
                    islikelycause: bool,
                }
                Attributed {
                    entry,
                    islikelycause: *islikelycause,
                }
                .serialize(serializer)
            }
        }
    }
}

/// Attribution of a page deletion, reconstructed without stable
/// archive→log ids.
#[derive(Debug, Clone)]
pub enum PageDeleted {
    Suppressed,
    Entry {
        entry: LogEntry,
        /// The chosen log row did not match the archive row's page id
        /// exactly; the attribution is a timestamp-proximity guess.
        guessed: bool,
    },
}

impl Serialize for PageDeleted {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PageDeleted::Suppressed => serializer.serialize_bool(true),
            PageDeleted::Entry { entry, guessed } => {
                #[derive(Serialize)]
                struct Attributed<'a> {
                    #[serde(flatten)]
                    entry: &'a LogEntry,
                    guessed: bool,
                }
                Attributed {
                    entry,
                    guessed: *guessed,
                }
                .serialize(serializer)
            }
        }
    }
}

/// One of an actor's revisions hidden by revision-level deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedRevision {
    pub revid: u64,
    pub parentid: u64,
    pub minor: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub size: i64,
    pub comment: Option<String>,
    pub page: PageRef,
    /// Decoded `rev_deleted` mask of the revision itself.
    pub hidden: DeletionFlags,
    pub deleted: Deleted,
}

/// A page created by an actor and since deleted.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedPage {
    /// Absent for rows from the pre-modern schema without stable page ids.
    pub pageid: Option<u64>,
    #[serde(rename = "ns")]
    pub namespace: i64,
    pub title: String,
    pub created: Option<DateTime<Utc>>,
    pub length: i64,
    pub deleted: PageDeleted,
}

/// Parses the replica's 14-digit `YYYYMMDDHHMMSS` timestamp form.
pub fn parse_mw_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Renders a timestamp back into the replica's 14-digit form.
pub fn to_mw_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiki_host_strips_scheme() {
        let wiki = Wiki {
            dbname: "enwiki".into(),
            url: "https://en.wikipedia.org".into(),
            lang: "en".into(),
            private: false,
            closed: false,
            fishbowl: false,
            nonglobal: false,
        };
        assert_eq!(wiki.host(), "en.wikipedia.org");
        assert_eq!(wiki.api_url(), "https://en.wikipedia.org/w/api.php");
    }

    #[test]
    fn missing_revision_serializes_discriminator() {
        let rev = Revision::missing(9_999_999_999);
        let json = serde_json::to_value(&rev).unwrap();
        assert_eq!(json["revid"], 9_999_999_999u64);
        assert_eq!(json["missing"], true);
    }

    #[test]
    fn deletion_flags_decode() {
        let flags = DeletionFlags::from_bits(0);
        assert_eq!(flags, DeletionFlags::default());

        let flags = DeletionFlags::from_bits(1);
        assert!(flags.content && !flags.comment && !flags.user && !flags.restricted);

        let flags = DeletionFlags::from_bits(0b1010);
        assert!(!flags.content && flags.comment && !flags.user && flags.restricted);

        let flags = DeletionFlags::from_bits(0b1111);
        assert!(flags.content && flags.comment && flags.user && flags.restricted);
    }

    #[test]
    fn suppressed_deletion_serializes_as_true() {
        let json = serde_json::to_value(Deleted::Suppressed).unwrap();
        assert_eq!(json, serde_json::json!(true));
    }

    #[test]
    fn attributed_deletion_flattens_entry() {
        let deleted = Deleted::Entry {
            entry: LogEntry {
                logid: 77,
                timestamp: parse_mw_timestamp("20240101120000"),
                actor: Some("Admin".into()),
                comment: Some("per policy".into()),
                tags: vec![],
                params: DeletionParams {
                    kind: "revision".into(),
                    ids: vec![1, 2, 3],
                    old: DeletionFlags::from_bits(0),
                    new: DeletionFlags::from_bits(1),
                },
            },
            islikelycause: true,
        };
        let json = serde_json::to_value(&deleted).unwrap();
        assert_eq!(json["logid"], 77);
        assert_eq!(json["islikelycause"], true);
        assert_eq!(json["params"]["type"], "revision");
        assert_eq!(json["params"]["new"]["content"], true);
    }

    #[test]
    fn mw_timestamp_roundtrip() {
        let parsed = parse_mw_timestamp("20230507093015").unwrap();
        assert_eq!(to_mw_timestamp(&parsed), "20230507093015");
        assert!(parse_mw_timestamp("not-a-timestamp").is_none());
        assert!(parse_mw_timestamp("2023").is_none());
    }
}
