use serde::{Deserialize, Deserializer, Serialize};

/// A single scraped listing, as it travels through the pipeline.
///
/// This struct is the unified wire format exchanged between:
/// - Source collectors (one per scraped site)
/// - The `providers` batch queue
/// - The aggregator / reconciler
///
/// A batch on the wire is a plain JSON array of records:
///
/// ```json
/// [{"id":0,"name":"Ana","link":"https://…","phone":"1122334455",
///   "place":"Palermo","source":"https://site","pics":["https://…"]}]
/// ```
///
/// DESIGN NOTES:
/// - `id` is assigned by the store on persist; collectors send `0`.
/// - Validity is re-evaluated by the aggregator on every cycle and is
///   never cached on the record itself.
/// - `pics` tolerates `null` because older producers emitted it for
///   empty picture lists.
///
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Store-assigned identity (0 until persisted)
    #[serde(default)]
    pub id: i32,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Detail page the record was extracted from
    #[serde(default)]
    pub link: String,

    /// Contact phone, as extracted (normalised during validation)
    #[serde(default)]
    pub phone: String,

    /// Zone name
    #[serde(default)]
    pub place: String,

    /// Identity of the collector that produced the record
    #[serde(default)]
    pub source: String,

    /// Ordered picture URLs
    #[serde(default, deserialize_with = "null_as_empty")]
    pub pics: Vec<String>,
}

/// Decodes a transported batch.
pub fn decode_batch(payload: &[u8]) -> serde_json::Result<Vec<Record>> {
    serde_json::from_slice(payload)
}

/// Encodes a batch for transport.
pub fn encode_batch(records: &[Record]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(records)
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

// ------------------------------------------------------------
// Showcase read model
// ------------------------------------------------------------
//
// What downstream readers get from "list all providers":
// a persisted provider joined with its zone, its source and
// every picture row, ordered by provider id.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ShowcaseProvider {
    pub id: i32,
    pub name: String,
    pub phone: String,
    pub link: String,
    pub place: String,
    pub source: String,
    pub pics: Vec<String>,
}
