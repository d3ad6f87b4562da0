use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};

use camino::Utf8Path;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::JoinError;

/// A SciREX release document. Only the fields used for joining are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct ScirexDocument {
    pub doc_id: String,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub sentences: Vec<[usize; 2]>,
    #[serde(default)]
    pub sections: Vec<[usize; 2]>,
}

#[derive(Debug, Deserialize)]
struct DocIdOnly {
    doc_id: String,
}

fn for_each_line<T, F>(path: &Utf8Path, mut visit: F) -> Result<(), JoinError>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    let file = File::open(path.as_std_path())
        .map_err(|err| JoinError::Filesystem(format!("open {path}: {err}")))?;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| JoinError::Filesystem(format!("read {path}: {err}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line)
            .map_err(|err| JoinError::ScirexParse(format!("{path}:{}: {err}", line_no + 1)))?;
        visit(value);
    }
    Ok(())
}

pub fn read_documents(path: &Utf8Path) -> Result<Vec<ScirexDocument>, JoinError> {
    let mut documents = Vec::new();
    for_each_line(path, |doc: ScirexDocument| documents.push(doc))?;
    Ok(documents)
}

/// Document ids across all splits, in file order, first occurrence kept.
pub fn collect_doc_ids<P: AsRef<Utf8Path>>(splits: &[P]) -> Result<Vec<String>, JoinError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for split in splits {
        for_each_line(split.as_ref(), |doc: DocIdOnly| {
            if seen.insert(doc.doc_id.clone()) {
                ids.push(doc.doc_id);
            }
        })?;
    }
    tracing::debug!(count = ids.len(), "collected SciREX document ids");
    Ok(ids)
}

/// The title is the first sentence span of the document's word list.
pub fn document_title(doc: &ScirexDocument) -> Result<String, JoinError> {
    if doc.sections.is_empty() {
        return Err(JoinError::EmptyScirexDocument(doc.doc_id.clone()));
    }
    let [start, end] = *doc.sentences.first().ok_or_else(|| {
        JoinError::ScirexParse(format!("document {} has no sentences", doc.doc_id))
    })?;
    let tokens = doc.words.get(start..end).ok_or_else(|| {
        JoinError::ScirexParse(format!(
            "document {} sentence span {start}..{end} is out of range",
            doc.doc_id
        ))
    })?;
    Ok(tokens.join(" "))
}
