//! Ranked nearest-chunk search over a consistent view of the corpus.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::Serialize;

use crate::corpus::CorpusState;
use crate::error::{CorpusError, CorpusResult};
use crate::layout::pca;
use crate::types::{ChunkId, ChunkState, LayoutDims, Score};

/// Characters of chunk text carried by search hits and exported points.
pub const PREVIEW_CHARS: usize = 160;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: ChunkId,
    /// Most current layout coordinates
    pub coords: Vec<f32>,
    /// `exp(-distance)`
    pub score: Score,
    pub distance: f32,
    pub state: ChunkState,
    pub source: String,
    pub chunk_index: u32,
    pub preview: String,
}

/// The `top_n` chunks nearest to `query`, by descending score with ties
/// broken by ascending identifier.
///
/// An empty corpus yields an empty result. A query of the wrong dimension
/// fails with `DimensionMismatch`.
pub fn search(state: &CorpusState, query: &[f32], top_n: usize) -> CorpusResult<Vec<SearchHit>> {
    let store = state.store();
    if store.is_empty() || top_n == 0 {
        return Ok(Vec::new());
    }
    if let Some(dimension) = store.dimension() {
        dimension.validate(query)?;
    }

    let nearest = state.builder().nearest(store, query, top_n, None);
    let mut hits: Vec<SearchHit> = nearest
        .into_iter()
        .filter_map(|(id, distance)| {
            let record = store.get(id).ok()?;
            let placement = state.layout().get(id)?;
            Some(SearchHit {
                id,
                coords: placement.coords.clone(),
                score: Score::from_distance(distance),
                distance,
                state: placement.state,
                source: record.source.clone(),
                chunk_index: record.chunk_index,
                preview: preview(&record.text, PREVIEW_CHARS),
            })
        })
        .collect();

    hits.sort_by(rank);
    Ok(hits)
}

/// Where the coordinates of search hits come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionMethod {
    /// Positions on the corpus layout. Accepts `layout` or `umap`.
    #[default]
    Layout,
    /// Principal components of the hits' own embeddings
    Pca,
}

impl FromStr for ProjectionMethod {
    type Err = CorpusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "layout" | "umap" => Ok(Self::Layout),
            "pca" => Ok(Self::Pca),
            other => Err(CorpusError::Config {
                reason: format!("unknown projection method '{other}', expected layout or pca"),
            }),
        }
    }
}

impl std::fmt::Display for ProjectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layout => write!(f, "layout"),
            Self::Pca => write!(f, "pca"),
        }
    }
}

/// Like [`search`], with hit coordinates taken from `method` in `dims`.
///
/// Layout coordinates exist only in the corpus layout's own dimension; asking
/// for another one is a `Config` error. PCA coordinates are computed over the
/// returned hits alone and may use either dimension.
pub fn search_projected(
    state: &CorpusState,
    query: &[f32],
    top_n: usize,
    method: ProjectionMethod,
    dims: LayoutDims,
) -> CorpusResult<Vec<SearchHit>> {
    let layout_dims = state.layout().dims();
    if method == ProjectionMethod::Layout && dims != layout_dims {
        return Err(CorpusError::Config {
            reason: format!(
                "corpus layout is {}-D, cannot serve {}-D layout coordinates (use method=pca)",
                layout_dims.get(),
                dims.get()
            ),
        });
    }

    let mut hits = search(state, query, top_n)?;
    if method == ProjectionMethod::Pca {
        let store = state.store();
        let embeddings = hits
            .iter()
            .map(|hit| store.get(hit.id).map(|record| record.embedding.as_slice()))
            .collect::<CorpusResult<Vec<&[f32]>>>()?;
        let coords = pca::project(&embeddings, dims.get());
        for (hit, coords) in hits.iter_mut().zip(coords) {
            hit.coords = coords;
        }
    }
    Ok(hits)
}

fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score.cmp(&a.score).then(a.id.cmp(&b.id))
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
