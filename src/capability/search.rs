//! In-process search index.
//!
//! The full search engine (tokenisation, stemming, document extraction) is
//! an external collaborator; this default implementation provides the
//! capability contract with simple substring ranking so handlers work out
//! of the box.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Diagnostic;
use crate::value::{OrderedMap, Value};

#[derive(Default)]
pub struct MemorySearchIndex {
    docs: RwLock<BTreeMap<String, Value>>,
}

impl MemorySearchIndex {
    pub fn new() -> MemorySearchIndex {
        MemorySearchIndex::default()
    }

    fn doc_text(doc: &Value) -> String {
        match doc {
            Value::Dict(map) => map
                .read()
                .iter()
                .map(|(_, v)| v.to_display_string())
                .collect::<Vec<_>>()
                .join(" "),
            other => other.to_display_string(),
        }
    }
}

#[async_trait]
impl super::SearchIndex for MemorySearchIndex {
    async fn add(&self, id: &str, doc: Value) -> Result<(), Diagnostic> {
        self.docs.write().insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, id: &str, doc: Value) -> Result<(), Diagnostic> {
        self.docs.write().insert(id.to_string(), doc);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), Diagnostic> {
        self.docs.write().remove(id);
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Value>, Diagnostic> {
        let needle = text.to_lowercase();
        let docs = self.docs.read();
        let mut hits = Vec::new();
        for (id, doc) in docs.iter() {
            if Self::doc_text(doc).to_lowercase().contains(&needle) {
                let mut row = OrderedMap::new();
                row.insert("id", Value::str(id));
                row.insert("doc", doc.clone());
                hits.push(Value::dict(row));
                if hits.len() >= limit {
                    break;
                }
            }
        }
        Ok(hits)
    }

    async fn reindex(&self) -> Result<(), Diagnostic> {
        Ok(())
    }

    async fn stats(&self) -> Result<Value, Diagnostic> {
        let mut stats = OrderedMap::new();
        stats.insert("documents", Value::Int(self.docs.read().len() as i64));
        Ok(Value::dict(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SearchIndex;

    #[tokio::test]
    async fn add_query_remove_round_trip() {
        let index = MemorySearchIndex::new();
        let mut doc = OrderedMap::new();
        doc.insert("title", Value::str("Quarterly report"));
        index.add("r1", Value::dict(doc)).await.unwrap();

        let hits = index.query("quarterly", 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        index.remove("r1").await.unwrap();
        let hits = index.query("quarterly", 10).await.unwrap();
        assert!(hits.is_empty());
    }
}
