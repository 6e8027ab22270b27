mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duraflow::client::Client;
use duraflow::runtime::{
    ActivityContext, ActivityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime,
};
use duraflow::samples::doc_generation::{
    self, ApplySuggestionsRequest, DocGenerationInput, GenerateDocumentationRequest,
    ProofreadRequest, ProofreadingResponse,
};

#[derive(Default)]
struct Counters {
    generate: AtomicU32,
    apply: AtomicU32,
    proofread: AtomicU32,
    publish: AtomicU32,
}

/// Model-backed activities stubbed out with counters. The proofreader
/// approves on `approve_on_attempt` (never, when `None`).
fn doc_activities(counters: Arc<Counters>, approve_on_attempt: Option<u32>) -> ActivityRegistry {
    let generate = counters.clone();
    let apply = counters.clone();
    let proofread = counters.clone();
    let publish = counters;
    ActivityRegistry::builder()
        .register("GatherProductInfo", |_ctx: ActivityContext, product: String| async move {
            Ok(format!("all about {product}"))
        })
        .register_typed("GenerateDocumentation", move |req: GenerateDocumentationRequest| {
            generate.generate.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("draft v1 ({})", req.product_info)) }
        })
        .register_typed("ApplySuggestions", move |req: ApplySuggestionsRequest| {
            let n = apply.apply.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok(format!(
                    "draft v{} ({}; {} suggestions)",
                    n + 1,
                    req.product_info,
                    req.suggestions.len()
                ))
            }
        })
        .register_typed("Proofread", move |_req: ProofreadRequest| {
            let attempt = proofread.proofread.fetch_add(1, Ordering::SeqCst) + 1;
            let meets = approve_on_attempt.is_some_and(|target| attempt >= target);
            async move {
                Ok(ProofreadingResponse {
                    meets_expectations: meets,
                    explanation: if meets {
                        "reads well".into()
                    } else {
                        format!("attempt {attempt} needs work")
                    },
                    suggestions: if meets {
                        Vec::new()
                    } else {
                        vec![format!("tighten section {attempt}")]
                    },
                })
            }
        })
        .register("RequestHumanApproval", |_ctx: ActivityContext, _doc: String| async move {
            Ok(String::new())
        })
        .register("PublishDocumentation", move |_ctx: ActivityContext, _doc: String| {
            publish.publish.fetch_add(1, Ordering::SeqCst);
            async move { Ok(String::new()) }
        })
        .build()
}

fn doc_orchestrations() -> OrchestrationRegistry {
    doc_generation::register(OrchestrationRegistry::builder()).build()
}

#[tokio::test]
async fn approved_documentation_is_published() {
    let store = common::in_memory_store();
    let counters = Arc::new(Counters::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        doc_activities(counters.clone(), Some(1)),
        doc_orchestrations(),
    );
    let client = Client::new(store.clone());

    client
        .start_orchestration_typed(
            "doc-1",
            doc_generation::ORCHESTRATION_NAME,
            &DocGenerationInput {
                product_name: "Widget".into(),
                approval_timeout_ms: 5_000,
            },
        )
        .await
        .unwrap();
    assert!(
        common::wait_for_subscription(&store, "doc-1", doc_generation::APPROVAL_EVENT, 5_000).await
    );
    client
        .raise_event("doc-1", doc_generation::APPROVAL_EVENT, "alice")
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("doc-1", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    assert!(output.contains("draft v1"), "{output}");
    assert_eq!(counters.generate.load(Ordering::SeqCst), 1);
    assert_eq!(counters.proofread.load(Ordering::SeqCst), 1);
    assert_eq!(counters.apply.load(Ordering::SeqCst), 0);
    assert_eq!(counters.publish.load(Ordering::SeqCst), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn succeeds_on_the_final_proofreading_attempt() {
    let store = common::in_memory_store();
    let counters = Arc::new(Counters::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        doc_activities(counters.clone(), Some(10)),
        doc_orchestrations(),
    );
    let client = Client::new(store.clone());

    client
        .start_orchestration_typed(
            "doc-2",
            doc_generation::ORCHESTRATION_NAME,
            &DocGenerationInput {
                product_name: "Widget".into(),
                approval_timeout_ms: 5_000,
            },
        )
        .await
        .unwrap();
    assert!(
        common::wait_for_subscription(&store, "doc-2", doc_generation::APPROVAL_EVENT, 5_000).await
    );
    client
        .raise_event("doc-2", doc_generation::APPROVAL_EVENT, "alice")
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("doc-2", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    // Nine rework rounds on top of the initial draft.
    assert!(output.contains("draft v10"), "{output}");
    assert_eq!(counters.generate.load(Ordering::SeqCst), 1);
    assert_eq!(counters.apply.load(Ordering::SeqCst), 9);
    assert_eq!(counters.proofread.load(Ordering::SeqCst), 10);
    assert_eq!(counters.publish.load(Ordering::SeqCst), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn fails_when_the_proofreader_is_never_satisfied() {
    let store = common::in_memory_store();
    let counters = Arc::new(Counters::default());
    let rt = Runtime::start_with_store(
        store.clone(),
        doc_activities(counters.clone(), None),
        doc_orchestrations(),
    );
    let client = Client::new(store.clone());

    client
        .start_orchestration_typed(
            "doc-3",
            doc_generation::ORCHESTRATION_NAME,
            &DocGenerationInput {
                product_name: "Widget".into(),
                approval_timeout_ms: 5_000,
            },
        )
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("doc-3", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(error.contains("10 attempts"), "{error}");
    assert_eq!(counters.proofread.load(Ordering::SeqCst), 10);
    assert_eq!(counters.apply.load(Ordering::SeqCst), 9);
    assert_eq!(counters.publish.load(Ordering::SeqCst), 0);
    rt.shutdown().await;
}
