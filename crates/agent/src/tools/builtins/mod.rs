//! Built-in tools, grouped by category.

pub mod computer;
pub mod hitl;
pub mod knowledge;
pub mod planning;
pub mod sandbox;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ToolsConfig;
use crate::tools::builtins::web::{PageFetcher, SearchApi};
use crate::tools::registry::ToolRegistry;

/// Assemble the default registry: HITL, planning, knowledge, web,
/// sandbox-resident, and computer-use tools.
pub fn default_registry(
    config: &ToolsConfig,
    search_api: Arc<dyn SearchApi>,
    page_fetcher: Arc<dyn PageFetcher>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let web_ttl = Duration::from_secs(config.web_cache_ttl_seconds);

    registry.add(Arc::new(hitl::AskClarificationTool));
    registry.add(Arc::new(hitl::RequestDecisionTool));
    registry.add(Arc::new(hitl::RequestEnvVarTool));

    registry.add(Arc::new(planning::TodoReadTool));
    registry.add(Arc::new(planning::TodoWriteTool));
    registry.add(Arc::new(planning::PlanEnterTool));
    registry.add(Arc::new(planning::PlanUpdateTool));
    registry.add(Arc::new(planning::PlanExitTool));

    registry.add(Arc::new(knowledge::MemorySearchTool));
    registry.add(Arc::new(knowledge::SummaryTool));

    registry.add(Arc::new(web::WebSearchTool::new(
        search_api,
        web_ttl,
        config.web_max_results,
    )));
    registry.add(Arc::new(web::WebScrapeTool::new(page_fetcher, web_ttl)));

    for tool in sandbox::SandboxResidentTool::all() {
        registry.add(Arc::new(tool));
    }

    registry.add(Arc::new(computer::ScreenshotTool));
    registry.add(Arc::new(computer::ClickTool));
    registry.add(Arc::new(computer::TypeTool));
    registry.add(Arc::new(computer::ScrollTool));
    registry.add(Arc::new(computer::BrowserNavigateTool));

    registry
}
