use std::collections::HashSet;

use tracing::info;
use tracing::warn;

use super::firestore::DocumentStore;
use super::firestore::DocumentWrite;
use super::firestore::FieldValue;
use super::firestore::Fields;
use super::firestore::WriteBatcher;
use super::transform::Realizacao;
use super::transform::to_display_name;
use crate::error::FlowResult;

pub const REALIZACAO: &str = "realizacao";
pub const BAIRRO: &str = "bairro";
pub const STATUS: &str = "status";
pub const ORGAO: &str = "orgao";
pub const PROGRAMA: &str = "programa";
pub const TEMA: &str = "tema";

/// Outcome of one upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub realizacoes: usize,
    pub skipped: usize,
    pub created_references: usize,
    pub writes: usize,
    pub commits: usize,
}

/// Ids already present in the reference collections.
#[derive(Debug, Clone, Default)]
pub struct KnownIds {
    pub bairros: HashSet<String>,
    pub statuses: HashSet<String>,
    pub orgaos: HashSet<String>,
    pub programas: HashSet<String>,
    pub temas: HashSet<String>,
}

impl KnownIds {
    pub async fn load(store: &dyn DocumentStore) -> FlowResult<Self> {
        let ids = |collection: &'static str| async move {
            store
                .document_ids(collection)
                .await
                .map(|ids| ids.into_iter().collect::<HashSet<String>>())
        };
        Ok(Self {
            bairros: ids(BAIRRO).await?,
            statuses: ids(STATUS).await?,
            orgaos: ids(ORGAO).await?,
            programas: ids(PROGRAMA).await?,
            temas: ids(TEMA).await?,
        })
    }

    /// The reference a work item points at that does not exist, if any.
    /// Programs and themes are created on demand and never block an item.
    fn missing_reference<'a>(
        &self,
        realizacao: &'a Realizacao,
    ) -> Option<(&'static str, &'a str)> {
        [
            (BAIRRO, &self.bairros, realizacao.id_bairro.as_str()),
            (STATUS, &self.statuses, realizacao.id_status.as_str()),
            (ORGAO, &self.orgaos, realizacao.id_orgao.as_str()),
        ]
        .into_iter()
        .find(|(_, known, id)| !known.contains(*id))
        .map(|(collection, _, id)| (collection, id))
    }
}

fn link(realizacao: &Realizacao, field: &str, id: &str) -> Fields {
    [
        ("id_realizacao".to_string(), FieldValue::from(realizacao.id.as_str())),
        (field.to_string(), FieldValue::from(id)),
    ]
    .into_iter()
    .collect()
}

/// Writes work items and their agency, program and theme links.
///
/// Items whose neighbourhood, status or agency is unknown are skipped. Unknown
/// programs and themes get a reference document named after their id. Every
/// commit carries at most `batch_limit` writes.
pub async fn upload_realizacoes(
    store: &dyn DocumentStore,
    realizacoes: &[Realizacao],
    batch_limit: usize,
) -> FlowResult<UploadSummary> {
    let mut known = KnownIds::load(store).await?;
    let mut summary = UploadSummary::default();

    let mut references = WriteBatcher::new(store, batch_limit);
    let mut accepted = Vec::with_capacity(realizacoes.len());
    for realizacao in realizacoes {
        if let Some((collection, id)) = known.missing_reference(realizacao) {
            warn!(
                "Skipping realizacao {}: {collection} `{id}` not found in Firestore.",
                realizacao.id
            );
            summary.skipped += 1;
            continue;
        }
        if known.programas.insert(realizacao.id_programa.clone()) {
            let fields: Fields = [
                ("nome".to_string(), to_display_name(&realizacao.id_programa).into()),
                ("descricao".to_string(), FieldValue::from("")),
            ]
            .into_iter()
            .collect();
            references
                .set(DocumentWrite::new(PROGRAMA, &realizacao.id_programa, fields))
                .await?;
        }
        if known.temas.insert(realizacao.id_tema.clone()) {
            let fields: Fields =
                [("nome".to_string(), to_display_name(&realizacao.id_tema).into())]
                    .into_iter()
                    .collect();
            references
                .set(DocumentWrite::new(TEMA, &realizacao.id_tema, fields))
                .await?;
        }
        accepted.push(realizacao);
    }
    references.flush().await?;
    summary.created_references = references.written();

    let mut documents = WriteBatcher::new(store, batch_limit);
    for realizacao in accepted {
        let id = &realizacao.id;
        documents
            .set(DocumentWrite::new(REALIZACAO, id, realizacao.fields()))
            .await?;
        for (collection, field, target) in [
            ("realizacao_orgao", "id_orgao", &realizacao.id_orgao),
            ("realizacao_programa", "id_programa", &realizacao.id_programa),
            ("realizacao_tema", "id_tema", &realizacao.id_tema),
        ] {
            documents
                .set(DocumentWrite::new(
                    collection,
                    format!("{id}__{target}"),
                    link(realizacao, field, target),
                ))
                .await?;
        }
        summary.realizacoes += 1;
    }
    documents.flush().await?;

    summary.writes = summary.created_references + documents.written();
    summary.commits = references.commits() + documents.commits();
    info!(
        "Uploaded {} realizacoes ({} skipped) in {} commits.",
        summary.realizacoes, summary.skipped, summary.commits
    );
    Ok(summary)
}
