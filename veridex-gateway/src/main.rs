//! Veridex gateway binary.
//!
//! Opens the durable stores, seeds the rule pack registry, wires the five
//! subsystems into the shared HTTP surface, and serves it until SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use veridex::config::PlatformConfig;
use veridex::http::{EnvTokenProvider, GatewayClient, TokenProvider};
use veridex::ledger::{LedgerService, LedgerStore};
use veridex::ocr::{FastTierOcr, HttpOcrEngine, OcrPipeline, UnconfiguredTier, VisionTierOcr};
use veridex::rag::{HashingEmbedder, KnowledgeStore, RagService};
use veridex::registry::{InMemoryRegistry, RulePackRegistration};
use veridex::router::{HttpRulePackConnector, PolicyRouter};
use veridex::redaction::Redactor;
use veridex::server::{app, AppState};
use veridex::workflow::designer::HttpPackPipeline;
use veridex::workflow::executor::HttpWorkflowRunner;
use veridex::workflow::{
    DesignerCompiler, HilPolicy, SqliteApprovalStore, WorkflowExecutor, WorkflowRecordStore,
};

#[derive(Parser, Debug)]
#[command(name = "veridex-gateway", about = "Veridex compliance gateway", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Directory for the SQLite stores.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Base URL of the upstream platform gateway (orchestrator, pack
    /// compiler, redaction).
    #[arg(long, env = "VERIDEX_GATEWAY_URL")]
    gateway_url: String,

    /// Fast-tier OCR engine base URL; the tier is reported unavailable when
    /// unset.
    #[arg(long, env = "VERIDEX_OCR_FAST_URL")]
    ocr_fast_url: Option<String>,

    /// Vision-tier OCR engine base URL.
    #[arg(long, env = "VERIDEX_OCR_VISION_URL")]
    ocr_vision_url: Option<String>,

    /// JSON file with rule pack registrations to seed the registry.
    #[arg(long)]
    registry_file: Option<PathBuf>,
}

async fn seed_registry(registry: &InMemoryRegistry, path: &PathBuf) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read registry file {}", path.display()))?;
    let registrations: Vec<RulePackRegistration> =
        serde_json::from_str(&raw).context("registry file is not a registration list")?;
    let count = registrations.len();
    for registration in registrations {
        registry
            .register(registration)
            .await
            .map_err(|e| anyhow::anyhow!("registry seed failed: {}", e))?;
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = PlatformConfig::from_env();
    let token_provider: Arc<dyn TokenProvider> = Arc::new(EnvTokenProvider::new());

    let upstream = Arc::new(
        GatewayClient::new(&args.gateway_url, token_provider.clone())
            .map_err(|e| anyhow::anyhow!("gateway client init failed: {}", e))?,
    );

    // Durable stores.
    let ledger = Arc::new(LedgerService::new(
        LedgerStore::open(&args.data_dir.join("ledger.db"))
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    ));
    let approvals = Arc::new(
        SqliteApprovalStore::open(&args.data_dir.join("workflow.db"))
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    let records = Arc::new(
        WorkflowRecordStore::open(&args.data_dir.join("workflow-records.db"))
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    let knowledge = Arc::new(
        KnowledgeStore::open(&args.data_dir.join("knowledge.db"))
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    let ocr_store = Arc::new(
        veridex::ocr::OcrStore::open(&args.data_dir.join("ocr.db"))
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );

    // Registry and policy router.
    let registry = Arc::new(InMemoryRegistry::new());
    if let Some(path) = &args.registry_file {
        let count = seed_registry(&registry, path).await?;
        tracing::info!("seeded {} rule pack registrations", count);
    }
    let router = Arc::new(PolicyRouter::new(
        registry.clone(),
        Arc::new(HttpRulePackConnector::new(token_provider.clone())),
    ));

    // Workflow executor and designer compile.
    let redactor = if config.redaction.use_remote {
        Redactor::with_remote(upstream.clone(), config.redaction.path.clone())
    } else {
        Redactor::local()
    };
    let workflows = Arc::new(WorkflowExecutor::new(
        HilPolicy::new(&config.hil),
        approvals,
        records,
        Arc::new(HttpWorkflowRunner::new(upstream.clone())),
        redactor,
        ledger.clone(),
    ));
    let designer = Arc::new(
        DesignerCompiler::new(Arc::new(HttpPackPipeline::new(upstream.clone())), ledger.clone())
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );

    // Knowledge base; warm the embedder before serving.
    let rag = Arc::new(RagService::new(
        knowledge,
        Arc::new(HashingEmbedder::new()),
        config.retrieval.clone(),
    ));
    rag.init().map_err(|e| anyhow::anyhow!("{}", e))?;

    // OCR tiers.
    let fast: Arc<dyn FastTierOcr> = match &args.ocr_fast_url {
        Some(url) => Arc::new(HttpOcrEngine::new(
            Arc::new(
                GatewayClient::new(url, token_provider.clone())
                    .map_err(|e| anyhow::anyhow!("{}", e))?,
            ),
            "/extract",
        )),
        None => Arc::new(UnconfiguredTier),
    };
    let vision: Option<Arc<dyn VisionTierOcr>> = match &args.ocr_vision_url {
        Some(url) => Some(Arc::new(HttpOcrEngine::new(
            Arc::new(
                GatewayClient::new(url, token_provider.clone())
                    .map_err(|e| anyhow::anyhow!("{}", e))?,
            ),
            "/extract",
        ))),
        None => None,
    };
    let ocr = Arc::new(OcrPipeline::new(
        fast,
        vision,
        None,
        ocr_store,
        ledger.clone(),
        config.ocr.clone(),
    ));

    let state = Arc::new(AppState {
        router: router.clone(),
        workflows,
        designer,
        ledger,
        rag: rag.clone(),
        ocr,
        registry,
        decisions: Default::default(),
    });

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!("veridex gateway listening on {}", args.listen);

    veridex::server::axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    // Drain shared state before exit.
    router.cleanup().await;
    rag.shutdown();
    tracing::info!("veridex gateway shutdown complete");
    Ok(())
}
