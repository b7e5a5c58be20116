use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
    Tokens(Vec<Vec<u32>>),
}

impl EmbeddingInput {
    /// Text inputs in order. Token arrays have no text form and yield nothing.
    pub fn texts(&self) -> Vec<String> {
        match self {
            Self::One(one) => vec![one.clone()],
            Self::Many(many) => many.clone(),
            Self::Tokens(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EmbeddingRequest {
    pub fn new(model: impl Into<String>, input: EmbeddingInput) -> Self {
        Self {
            model: model.into(),
            input,
            encoding_format: None,
            dimensions: None,
            user: None,
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingVector {
    Float(Vec<f32>),
    Base64(String),
}

impl EmbeddingVector {
    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Self::Float(values) => Some(values),
            Self::Base64(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    #[serde(default = "default_embedding_object")]
    pub object: String,
    #[serde(default)]
    pub index: u32,
    pub embedding: EmbeddingVector,
}

fn default_embedding_object() -> String {
    "embedding".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default = "default_list_object")]
    pub object: String,
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<EmbeddingUsage>,
}

fn default_list_object() -> String {
    "list".to_string()
}

impl EmbeddingResponse {
    pub fn from_vectors(model: impl Into<String>, vectors: Vec<Vec<f32>>) -> Self {
        Self {
            object: default_list_object(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, values)| EmbeddingData {
                    object: default_embedding_object(),
                    index: index as u32,
                    embedding: EmbeddingVector::Float(values),
                })
                .collect(),
            model: model.into(),
            usage: None,
        }
    }

    /// Float vectors ordered by `index`.
    pub fn vectors(&self) -> Vec<Vec<f32>> {
        let mut data: Vec<&EmbeddingData> = self.data.iter().collect();
        data.sort_by_key(|item| item.index);
        data.into_iter()
            .filter_map(|item| item.embedding.as_floats().map(<[f32]>::to_vec))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_accepts_string_or_list() {
        let one: EmbeddingRequest =
            serde_json::from_value(json!({"model": "e", "input": "hi"})).unwrap();
        assert_eq!(one.input.texts(), vec!["hi".to_string()]);
        let many: EmbeddingRequest =
            serde_json::from_value(json!({"model": "e", "input": ["a", "b"]})).unwrap();
        assert_eq!(many.input.texts().len(), 2);
    }

    #[test]
    fn vectors_are_sorted_by_index() {
        let response: EmbeddingResponse = serde_json::from_value(json!({
            "object": "list",
            "model": "e",
            "data": [
                {"object": "embedding", "index": 1, "embedding": [0.0, 1.0]},
                {"object": "embedding", "index": 0, "embedding": [1.0, 0.0]}
            ]
        }))
        .unwrap();
        assert_eq!(response.vectors(), vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }
}
