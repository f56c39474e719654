// Hybrid search across structural and semantic strategies.

use anyhow::Result;
use std::sync::Arc;

use cartograph::embedding_service::EmbeddingService;
use cartograph::entity::{Entity, EntityData, SymbolData, SymbolKind};
use cartograph::entity_service::EntityService;
use cartograph::events::EventBus;
use cartograph::executor::GraphExecutor;
use cartograph::memory_graph::MemoryGraphStore;
use cartograph::search_service::{SearchFilters, SearchRequest, SearchService, SearchType};
use cartograph::vector_index::VectorIndexService;
use cartograph::{EntityId, HashEmbeddingProvider, RepoPath};

async fn build() -> Result<(SearchService, Arc<EntityService>, Arc<EmbeddingService>)> {
    let store = Arc::new(MemoryGraphStore::new());
    let events = Arc::new(EventBus::new());
    let executor = Arc::new(GraphExecutor::new(store, events.clone()));
    let vectors = Arc::new(VectorIndexService::new(executor.clone()));
    let provider = Arc::new(HashEmbeddingProvider::with_dimensions(64));
    let embeddings = Arc::new(EmbeddingService::new(provider, vectors, events.clone()));
    embeddings.initialize_index()?;
    let entities = Arc::new(EntityService::new(executor.clone()));
    let search = SearchService::new(executor, embeddings.clone(), events);
    Ok((search, entities, embeddings))
}

fn class_symbol(id: &str, name: &str, path: &str) -> Entity {
    Entity::new(
        EntityId::new(id).unwrap(),
        EntityData::Symbol(SymbolData {
            name: name.to_string(),
            kind: SymbolKind::Class,
            signature: format!("class {name}"),
            docstring: Some(format!("{name} handles user authentication")),
            visibility: "public".to_string(),
            is_exported: true,
            is_deprecated: false,
            location: None,
            detail: Default::default(),
        }),
    )
    .with_path(RepoPath::new(path).unwrap())
    .with_language("typescript")
}

#[tokio::test]
async fn hybrid_search_merges_structural_and_semantic() -> Result<()> {
    let (search, entities, embeddings) = build().await?;
    let seeded = vec![
        class_symbol("sym:src/auth.ts#AuthService", "AuthService", "src/auth.ts"),
        class_symbol("sym:src/user.ts#UserService", "UserService", "src/user.ts"),
        class_symbol("sym:src/cart.ts#CartService", "CartService", "src/cart.ts"),
    ];
    for entity in &seeded {
        entities.upsert(entity).await?;
        embeddings.generate_and_store(entity).await?;
    }

    let results = search
        .search(&SearchRequest {
            query: "User auth".to_string(),
            filters: SearchFilters {
                language: Some("typescript".to_string()),
                ..Default::default()
            },
            limit: Some(10),
            ..Default::default()
        })
        .await?;

    assert!(results.len() <= 10);

    // A pure-name hybrid query always carries the structural match through
    let auth = search
        .search(&SearchRequest {
            query: "auth".to_string(),
            limit: Some(10),
            ..Default::default()
        })
        .await?;
    let auth_hit = auth
        .iter()
        .find(|r| r.entity_id.as_str() == "sym:src/auth.ts#AuthService")
        .expect("structural half must surface AuthService");
    // Exact structural score 1.0 is boosted to 1.2, or averaged with the
    // semantic score when both halves matched; either way it stays positive
    assert!(auth_hit.score > 0.05);

    // Results are sorted by descending score
    for pair in auth.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    Ok(())
}

#[tokio::test]
async fn explicit_semantic_search_returns_neighbors() -> Result<()> {
    let (search, entities, embeddings) = build().await?;
    let auth = class_symbol("sym:src/auth.ts#AuthService", "AuthService", "src/auth.ts");
    entities.upsert(&auth).await?;
    embeddings.generate_and_store(&auth).await?;

    let results = search
        .search(&SearchRequest {
            query: "authentication".to_string(),
            search_type: Some(SearchType::Semantic),
            limit: Some(5),
            ..Default::default()
        })
        .await?;
    // The hash provider is not semantic, but the pipeline must return
    // well-formed scored hits
    for result in &results {
        assert!(result.score <= 1.0 + f32::EPSILON);
    }
    Ok(())
}

#[tokio::test]
async fn path_queries_bypass_the_semantic_path() -> Result<()> {
    let (search, entities, _) = build().await?;
    entities
        .upsert(&class_symbol(
            "sym:src/auth.ts#AuthService",
            "AuthService",
            "src/auth.ts",
        ))
        .await?;

    let results = search
        .search(&SearchRequest {
            query: "src/auth.ts".to_string(),
            ..Default::default()
        })
        .await?;
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|r| r.path.as_deref() == Some("src/auth.ts")));
    Ok(())
}
