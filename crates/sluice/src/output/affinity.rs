//! 🧲 Index affinity: keep updates on the index a document already lives in.
//!
//! With date-bucketed indices, an update for a document written yesterday would
//! otherwise land in today's bucket and create a twin. Before routing a chunk we
//! ask the cluster, once, where each id currently lives.
//!
//! Best effort. A failed lookup degrades to an empty map unless
//! `affinity_fail_on_error` says otherwise.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{TransportErrorKind, TransportFailure};
use crate::output::client::ConnectionHandle;

/// 🗺️ Document id → the index currently holding it.
pub type AffinityMap = HashMap<String, String>;

/// 🪭 Hits budgeted per id in one page. An id can live in several date buckets, and
/// each bucket it lives in eats a hit.
const HITS_PER_ID: usize = 4;

/// 🔍 The id lookup: newest index first, no source, a few hits per id.
pub fn build_query(ids: &BTreeSet<String>) -> Value {
    json!({
        "query": {"ids": {"values": ids}},
        "_source": false,
        "sort": [{"_index": {"order": "desc"}}],
        "size": ids.len() * HITS_PER_ID,
    })
}

/// 🏆 First hit per id wins, which thanks to the sort is the newest index.
pub fn parse_hits(response: &Value) -> AffinityMap {
    let mut map = AffinityMap::new();
    for hit in hits_of(response) {
        let (Some(id), Some(index)) = (
            hit.get("_id").and_then(Value::as_str),
            hit.get("_index").and_then(Value::as_str),
        ) else {
            continue;
        };
        map.entry(id.to_string()).or_insert_with(|| index.to_string());
    }
    map
}

fn hits_of(response: &Value) -> &[Value] {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// 📡 Run the lookup against `{index_pattern}/_search`.
///
/// A page that comes back full may have been crowded out by ids living in many
/// buckets. The ids still unaccounted for are asked about again on their own, until
/// a page comes back short or a round resolves nothing new.
pub async fn lookup(
    handle: &ConnectionHandle,
    index_pattern: &str,
    ids: &BTreeSet<String>,
) -> Result<AffinityMap, TransportFailure> {
    let mut map = AffinityMap::new();
    let mut pending = ids.clone();
    let mut rounds = 0usize;
    while !pending.is_empty() {
        rounds += 1;
        let response = search(handle, index_pattern, &pending).await?;
        let page_full = hits_of(&response).len() >= pending.len() * HITS_PER_ID;
        let before = map.len();
        for (id, index) in parse_hits(&response) {
            if pending.contains(&id) {
                map.entry(id).or_insert(index);
            }
        }
        if !page_full || map.len() == before {
            break;
        }
        pending.retain(|id| !map.contains_key(id));
    }
    debug!(
        "🧲 affinity lookup on '{index_pattern}': {} of {} ids already live somewhere ({rounds} rounds)",
        map.len(),
        ids.len()
    );
    Ok(map)
}

async fn search(
    handle: &ConnectionHandle,
    index_pattern: &str,
    ids: &BTreeSet<String>,
) -> Result<Value, TransportFailure> {
    let body = build_query(ids).to_string();
    let response = handle
        .request(reqwest::Method::POST, &format!("{index_pattern}/_search"))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(TransportFailure::from_reqwest)?;
    let status = response.status();
    let text = response.text().await.map_err(TransportFailure::from_reqwest)?;
    if !status.is_success() {
        return Err(TransportFailure::from_status(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|err| TransportFailure::new(TransportErrorKind::Decode, err.to_string()))
}

/// 🧲 Lookup with the degrade-or-fail policy applied.
pub async fn resolve(
    handle: &ConnectionHandle,
    index_pattern: &str,
    ids: &BTreeSet<String>,
    fail_on_error: bool,
) -> Result<AffinityMap, TransportFailure> {
    match lookup(handle, index_pattern, ids).await {
        Ok(map) => Ok(map),
        Err(failure) if fail_on_error => Err(failure),
        Err(failure) => {
            warn!("⚠️ affinity lookup failed, routing by date instead: {failure}");
            Ok(AffinityMap::new())
        }
    }
}
