//! District geometry reconstruction from block-assignment uploads.
//!
//! Each county has a precomputed block-adjacency graph: nodes are block-ids
//! with a representative interior point, edges carry the shared-border
//! linestring, and a synthetic exterior node carries the county outline.
//! A district's polygon is the even-odd nesting of the rings stitched from
//! the edge boundary of its induced subgraph.

use std::collections::BTreeSet;

use ahash::AHashMap;
use anyhow::{Context, Result};
use geo::{Contains, Intersects, LineString, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};

use crate::{error::ScoreError, storage::ObjectStore};

/// Serialized graph node. The exterior node has no position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<[f64; 2]>,
}

/// Serialized graph edge with its shared-border linestring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub a: String,
    pub b: String,
    pub line: Vec<[f64; 2]>,
}

/// On-store graph format, gzipped JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFile {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Arena-backed adjacency graph; node handles are indices, never pointers.
#[derive(Debug, Default)]
pub struct BlockGraph {
    ids: Vec<String>,
    index: AHashMap<String, usize>,
    pos: Vec<Option<Point<f64>>>,
    edges: Vec<(usize, usize, LineString<f64>)>,
}

impl BlockGraph {
    pub fn from_file(file: GraphFile) -> Self {
        let mut graph = BlockGraph::default();
        graph.absorb(file);
        graph
    }

    /// Merge another county's graph in. Block-ids are globally unique
    /// (state+county+block FIPS), so this is a union of disjoint key spaces;
    /// a repeated id keeps its first node.
    pub fn absorb(&mut self, file: GraphFile) {
        for node in file.nodes {
            self.intern(node.id, node.pos.map(|[x, y]| Point::new(x, y)));
        }
        for edge in file.edges {
            let a = self.intern(edge.a, None);
            let b = self.intern(edge.b, None);
            let line = LineString::from(
                edge.line.iter().map(|&[x, y]| (x, y)).collect::<Vec<_>>(),
            );
            self.edges.push((a, b, line));
        }
    }

    fn intern(&mut self, id: String, pos: Option<Point<f64>>) -> usize {
        if let Some(&index) = self.index.get(&id) {
            if self.pos[index].is_none() {
                self.pos[index] = pos;
            }
            return index;
        }
        let index = self.ids.len();
        self.index.insert(id.clone(), index);
        self.ids.push(id);
        self.pos.push(pos);
        index
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    /// Representative interior point of one block.
    pub fn position(&self, block_id: &str) -> Option<Point<f64>> {
        self.index.get(block_id).and_then(|&index| self.pos[index])
    }

    /// Linestrings of edges crossing the boundary of the induced subgraph.
    pub fn edge_boundary(&self, block_ids: &[String]) -> Vec<&LineString<f64>> {
        let inside: BTreeSet<usize> = block_ids.iter()
            .filter_map(|id| self.index.get(id).copied())
            .collect();

        self.edges.iter()
            .filter(|(a, b, _)| inside.contains(a) != inside.contains(b))
            .map(|(_, _, line)| line)
            .collect()
    }
}

/// Store key of one county's block graph.
pub fn county_graph_key(state: &str, county5: &str) -> String {
    format!("data/{state}/graphs/2020/{county5}-tabblock.json.gz")
}

/// Load and combine the graphs of every county a district's blocks touch.
pub fn assemble_graph(
    store: &dyn ObjectStore,
    state: &str,
    block_ids: &[String],
) -> Result<BlockGraph> {
    let keys: BTreeSet<String> = block_ids.iter()
        .filter(|id| id.len() >= 5)
        .map(|id| county_graph_key(state, &id[..5]))
        .collect();

    let mut graph = BlockGraph::default();
    for key in keys {
        let object = store.get_object(&key)
            .with_context(|| format!("[polygonize::assemble_graph] Failed to read {key}"))?;
        let file: GraphFile = serde_json::from_slice(&object.decoded_body()?)
            .with_context(|| format!("[polygonize::assemble_graph] Failed to parse {key}"))?;
        graph.absorb(file);
    }

    tracing::debug!(state, blocks = block_ids.len(), nodes = graph.node_count(),
        "assembled county graphs");
    Ok(graph)
}

/// Synthesize a district's polygon from its block-ids.
///
/// Boundary linestrings are stitched into closed rings, nested even-odd
/// into polygons-with-holes, and filtered to the polygons covering at least
/// one of the district's block points.
pub fn polygonize_district(block_ids: &[String], graph: &BlockGraph) -> Result<MultiPolygon<f64>> {
    let boundary = graph.edge_boundary(block_ids);
    if boundary.is_empty() {
        return Err(ScoreError::InvalidUpload(
            "district blocks have no boundary in the adjacency graph".to_string()).into());
    }

    let rings = stitch_rings(&boundary);
    if rings.is_empty() {
        return Err(ScoreError::InvalidUpload(
            "district boundary does not close into rings".to_string()).into());
    }

    let polygons = nest_rings(rings);

    let points: Vec<Point<f64>> = block_ids.iter()
        .filter_map(|id| graph.position(id))
        .collect();
    let kept: Vec<Polygon<f64>> = polygons.into_iter()
        .filter(|polygon| points.iter().any(|point| polygon.intersects(point)))
        .collect();

    Ok(MultiPolygon(kept))
}

/// Endpoint key quantized to ~1e-7 degrees, so segments from different
/// counties stitch despite float noise.
#[inline]
fn quantize(point: (f64, f64)) -> (i64, i64) {
    ((point.0 * 1e7).round() as i64, (point.1 * 1e7).round() as i64)
}

/// Stitch unordered boundary segments into closed rings. Segments that never
/// close (dangling county edges) are dropped.
fn stitch_rings(segments: &[&LineString<f64>]) -> Vec<LineString<f64>> {
    let mut by_endpoint: AHashMap<(i64, i64), Vec<usize>> = AHashMap::default();
    for (index, segment) in segments.iter().enumerate() {
        let (Some(first), Some(last)) = (segment.0.first(), segment.0.last()) else { continue };
        by_endpoint.entry(quantize((first.x, first.y))).or_default().push(index);
        by_endpoint.entry(quantize((last.x, last.y))).or_default().push(index);
    }

    let mut used = vec![false; segments.len()];
    let mut rings = Vec::new();

    for start in 0..segments.len() {
        if used[start] || segments[start].0.len() < 2 {
            continue;
        }
        used[start] = true;

        let mut coords: Vec<geo::Coord<f64>> = segments[start].0.clone();
        let origin = quantize((coords[0].x, coords[0].y));

        loop {
            let tail = quantize((coords[coords.len() - 1].x, coords[coords.len() - 1].y));
            if tail == origin {
                rings.push(LineString(coords));
                break;
            }

            let next = by_endpoint.get(&tail).into_iter().flatten()
                .copied()
                .find(|&candidate| !used[candidate]);
            let Some(next) = next else { break };
            used[next] = true;

            let segment = &segments[next].0;
            let head = quantize((segment[0].x, segment[0].y));
            if head == tail {
                coords.extend(segment.iter().skip(1).copied());
            } else {
                coords.extend(segment.iter().rev().skip(1).copied());
            }
        }
    }

    rings
}

/// Even-odd nesting: rings at even containment depth become shells, each
/// odd-depth ring becomes a hole of its immediate container.
fn nest_rings(rings: Vec<LineString<f64>>) -> Vec<Polygon<f64>> {
    let probes: Vec<Polygon<f64>> = rings.iter()
        .map(|ring| Polygon::new(ring.clone(), vec![]))
        .collect();

    // depth[i] = number of other rings strictly containing ring i
    let depths: Vec<usize> = probes.iter().enumerate()
        .map(|(i, _)| {
            probes.iter().enumerate()
                .filter(|&(j, container)| i != j && contains_ring(container, &rings[i]))
                .count()
        })
        .collect();

    let mut shells: Vec<(usize, Polygon<f64>)> = Vec::new();
    for (i, depth) in depths.iter().enumerate() {
        if depth % 2 == 0 {
            shells.push((i, probes[i].clone()));
        }
    }

    for (i, depth) in depths.iter().enumerate() {
        if depth % 2 == 0 {
            continue;
        }
        // immediate container: the deepest shell containing this hole
        let owner = shells.iter_mut()
            .filter(|(shell, _)| depths[*shell] == depth - 1)
            .filter(|(_, polygon)| contains_ring(polygon, &rings[i]))
            .max_by_key(|(shell, _)| depths[*shell]);
        if let Some((_, polygon)) = owner {
            let mut interiors: Vec<LineString<f64>> = polygon.interiors().to_vec();
            interiors.push(rings[i].clone());
            *polygon = Polygon::new(polygon.exterior().clone(), interiors);
        }
    }

    shells.into_iter().map(|(_, polygon)| polygon).collect()
}

fn contains_ring(container: &Polygon<f64>, ring: &LineString<f64>) -> bool {
    ring.0.iter().any(|c| container.contains(&Point::new(c.x, c.y)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Area;

    fn node(id: &str, x: f64, y: f64) -> GraphNode {
        GraphNode { id: id.to_string(), pos: Some([x, y]) }
    }

    fn edge(a: &str, b: &str, line: &[[f64; 2]]) -> GraphEdge {
        GraphEdge { a: a.to_string(), b: b.to_string(), line: line.to_vec() }
    }

    /// Two unit blocks side by side inside county 00001.
    fn two_block_county() -> GraphFile {
        GraphFile {
            nodes: vec![
                node("0000100001", 0.5, 0.5),
                node("0000100002", 1.5, 0.5),
                GraphNode { id: "00001#exterior".to_string(), pos: None },
            ],
            edges: vec![
                edge("0000100001", "0000100002", &[[1.0, 0.0], [1.0, 1.0]]),
                edge("0000100001", "00001#exterior",
                    &[[1.0, 1.0], [0.0, 1.0], [0.0, 0.0], [1.0, 0.0]]),
                edge("0000100002", "00001#exterior",
                    &[[1.0, 0.0], [2.0, 0.0], [2.0, 1.0], [1.0, 1.0]]),
            ],
        }
    }

    #[test]
    fn single_block_district_is_its_square() {
        let graph = BlockGraph::from_file(two_block_county());
        let district = vec!["0000100001".to_string()];
        let polygon = polygonize_district(&district, &graph).unwrap();
        assert_eq!(polygon.0.len(), 1);
        assert!((polygon.unsigned_area() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn two_block_district_merges_across_the_shared_border() {
        let graph = BlockGraph::from_file(two_block_county());
        let district = vec!["0000100001".to_string(), "0000100002".to_string()];
        let polygon = polygonize_district(&district, &graph).unwrap();
        assert_eq!(polygon.0.len(), 1);
        assert!((polygon.unsigned_area() - 2.0).abs() < 1e-9);
        // the internal border must not appear as a hole
        assert!(polygon.0[0].interiors().is_empty());
    }

    #[test]
    fn enclosed_block_becomes_a_hole() {
        let file = GraphFile {
            nodes: vec![
                node("0000100010", 0.1, 0.1),
                node("0000100011", 1.5, 1.5),
                GraphNode { id: "00001#exterior".to_string(), pos: None },
            ],
            edges: vec![
                edge("0000100010", "00001#exterior",
                    &[[0.0, 0.0], [3.0, 0.0], [3.0, 3.0], [0.0, 3.0], [0.0, 0.0]]),
                edge("0000100010", "0000100011",
                    &[[1.0, 1.0], [2.0, 1.0], [2.0, 2.0], [1.0, 2.0], [1.0, 1.0]]),
            ],
        };
        let graph = BlockGraph::from_file(file);
        let district = vec!["0000100010".to_string()];
        let polygon = polygonize_district(&district, &graph).unwrap();
        assert_eq!(polygon.0.len(), 1);
        assert_eq!(polygon.0[0].interiors().len(), 1);
        assert!((polygon.unsigned_area() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn graphs_combine_across_counties() {
        let mut graph = BlockGraph::from_file(two_block_county());
        graph.absorb(GraphFile {
            nodes: vec![node("0000200001", 2.5, 0.5)],
            edges: vec![edge("0000100002", "0000200001", &[[2.0, 0.0], [2.0, 1.0]])],
        });
        assert_eq!(graph.node_count(), 4);
        assert!(graph.position("0000200001").is_some());
    }

    #[test]
    fn assemble_reads_each_touched_county_once() {
        use std::io::Write;
        use flate2::{write::GzEncoder, Compression};
        use crate::storage::{MemStore, ObjectStore, PutOptions};

        let store = MemStore::new();
        let body = serde_json::to_vec(&two_block_county()).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).unwrap();
        store.put_object(
            &county_graph_key("XX", "00001"),
            encoder.finish().unwrap(),
            &PutOptions::private_text().with_encoding("gzip"),
        ).unwrap();

        let blocks = vec!["0000100001".to_string(), "0000100002".to_string()];
        let graph = assemble_graph(&store, "XX", &blocks).unwrap();
        assert_eq!(graph.node_count(), 3);

        let missing = vec!["9999900001".to_string()];
        assert!(assemble_graph(&store, "XX", &missing).is_err());
    }
}
