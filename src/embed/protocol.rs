//! JSON-lines wire protocol between the pool and its worker processes.
//!
//! One request per line on the worker's stdin, one response per line on its
//! stdout. Requests carry a fresh 128-bit id; the pool correlates responses
//! through its pending map and ignores responses arriving from a worker
//! other than the recorded dispatcher.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CandidateGrid, HybridEmbedding, QueryEmbedding};
use crate::models::ChunkRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestBody {
    ComputeHybrid {
        texts: Vec<String>,
    },
    EncodeQuery {
        text: String,
    },
    Rerank {
        query: Vec<Vec<f32>>,
        query_token_ids: Vec<u32>,
        candidates: Vec<CandidateGrid>,
    },
    ProcessFile {
        path: String,
        content: String,
        hash: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: Uuid,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl WireRequest {
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Hybrid { embeddings: Vec<HybridEmbedding> },
    Query { embedding: QueryEmbedding },
    Scores { scores: Vec<f32> },
    Chunks { records: Vec<ChunkRecord> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<ResponseBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    /// Worker resident set in bytes, self-reported with every response so
    /// the pool can enforce its memory cap without polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_rss: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tag_is_op() {
        let req = WireRequest::new(RequestBody::EncodeQuery {
            text: "where is login".to_string(),
        });
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"op\":\"encode_query\""));
        assert!(json.contains("\"id\""));

        let back: WireRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, req.id);
        match back.body {
            RequestBody::EncodeQuery { text } => assert_eq!(text, "where is login"),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let resp = WireResponse {
            id: Uuid::new_v4(),
            ok: Some(ResponseBody::Scores { scores: vec![1.0] }),
            err: None,
            memory_rss: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("err"));
        assert!(!json.contains("memory_rss"));
    }

    #[test]
    fn test_rerank_roundtrip() {
        let req = WireRequest::new(RequestBody::Rerank {
            query: vec![vec![0.5; 4]],
            query_token_ids: vec![7],
            candidates: vec![CandidateGrid {
                colbert: vec![1, -2, 3, -4],
                scale: 0.02,
            }],
        });
        let json = serde_json::to_string(&req).unwrap();
        let back: WireRequest = serde_json::from_str(&json).unwrap();
        match back.body {
            RequestBody::Rerank { candidates, .. } => {
                assert_eq!(candidates[0].colbert, vec![1, -2, 3, -4]);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }
}
