//! Fan-out worker: synthesize one district's polygon from its block list
//! and the state's county adjacency graphs. The calculation stage waits on
//! the WKT object this worker writes.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use wkt::ToWkt;

use crate::{
    data::Upload,
    polygonize::{assemble_graph, polygonize_district},
    storage::PutOptions,
};

use super::Env;

pub fn run(env: &Env, event: Value) -> Result<()> {
    let district = event.get("district").and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("[workers::polygonize] Event names no district"))? as usize;
    let upload: Upload = serde_json::from_value(event)
        .context("[workers::polygonize] Bad event payload")?;
    let model = upload.model.as_ref()
        .ok_or_else(|| anyhow!("[workers::polygonize] Upload {} has no model", upload.id))?;

    let object = env.store.get_object(&upload.assignment_key(district))
        .with_context(|| format!("[workers::polygonize] No block list for district {district}"))?;
    let block_ids: Vec<String> = object.text()?
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let graph = assemble_graph(env.store.as_ref(), &model.state, &block_ids)?;
    let geometry = polygonize_district(&block_ids, &graph)?;

    tracing::debug!(id = %upload.id, district, blocks = block_ids.len(),
        polygons = geometry.0.len(), "synthesized district geometry");

    env.store.put_object(
        &upload.geometry_wkt_key(district),
        geometry.wkt_string().into_bytes(),
        &PutOptions::private_text(),
    )
}
