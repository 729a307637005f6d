//! Procedural Memory (§4.10): trajectory storage, opportunistic skill
//! distillation, and similarity-ranked skill retrieval.
//!
//! Grounded on the same KV-store-backed cache shape as `learning.rs`
//! (per-tenant state rehydrated from `TypedStore` on first access, an
//! in-memory write-through cache guarded by `tokio::sync::RwLock`), with
//! the similarity scoring itself grounded on `PageContext::selector_
//! overlap`'s Jaccard-style comparison, generalised here to the full
//! weighted composite §4.10 specifies.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::kv_store::{KvStore, TypedStore};
use crate::types::page_context::PageContext;
use crate::types::trajectory::{
    ActionResult, ActionType, BrowsingAction, BrowsingSkill, BrowsingTrajectory, SkillExecutionTrace, SkillPreconditions,
};
use crate::types::TenantId;

const TRAJECTORIES_NAMESPACE: &str = "trajectories";
const SKILLS_NAMESPACE: &str = "skills";

/// Minimum number of similar successful trajectories required before a
/// skill is distilled (§4.10 "Skill extraction").
const DISTILLATION_THRESHOLD: usize = 3;

const PAGE_TYPE_WEIGHT: f32 = 0.4;
const SELECTOR_OVERLAP_WEIGHT: f32 = 0.3;
const FEATURE_OVERLAP_WEIGHT: f32 = 0.2;
const EMBEDDING_WEIGHT: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct SkillMatch {
    pub skill: BrowsingSkill,
    pub similarity: f32,
    pub preconditions_met: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProceduralMemoryStats {
    pub total_trajectories: usize,
    pub total_skills: usize,
    pub per_domain_trajectory_counts: HashMap<String, usize>,
    pub most_used_skills: Vec<(String, u64)>,
}

struct DomainMemory {
    trajectories: Vec<BrowsingTrajectory>,
    skills: Vec<BrowsingSkill>,
}

impl DomainMemory {
    fn empty() -> Self {
        Self {
            trajectories: Vec::new(),
            skills: Vec::new(),
        }
    }
}

/// Owns trajectories and distilled skills, indexed by `(tenant, domain)`
/// per §4.10 ("indexed by domain, start-url host, page-type").
pub struct ProceduralMemory<S: KvStore + ?Sized> {
    store: std::sync::Arc<S>,
    cache: RwLock<HashMap<(String, String), DomainMemory>>,
}

impl<S: KvStore + ?Sized> ProceduralMemory<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(tenant: &TenantId, domain: &str) -> (String, String) {
        (tenant.0.clone(), domain.to_string())
    }

    async fn load_domain(&self, tenant: &TenantId, domain: &str) -> DomainMemory {
        let typed = TypedStore::new(self.store.as_ref());
        let trajectories: Vec<BrowsingTrajectory> = typed
            .get_json(tenant, TRAJECTORIES_NAMESPACE, domain)
            .await
            .unwrap_or(None)
            .unwrap_or_default();
        let skills: Vec<BrowsingSkill> = typed
            .get_json(tenant, SKILLS_NAMESPACE, domain)
            .await
            .unwrap_or(None)
            .unwrap_or_default();
        DomainMemory { trajectories, skills }
    }

    async fn persist(&self, tenant: &TenantId, domain: &str, memory: &DomainMemory) -> StoreResult<()> {
        let typed = TypedStore::new(self.store.as_ref());
        typed.put_json(tenant, TRAJECTORIES_NAMESPACE, domain, &memory.trajectories).await?;
        typed.put_json(tenant, SKILLS_NAMESPACE, domain, &memory.skills).await?;
        Ok(())
    }

    async fn with_domain<F, R>(&self, tenant: &TenantId, domain: &str, f: F) -> R
    where
        F: FnOnce(&mut DomainMemory) -> R,
    {
        let key = Self::cache_key(tenant, domain);
        {
            let cache = self.cache.read().await;
            if !cache.contains_key(&key) {
                drop(cache);
                let loaded = self.load_domain(tenant, domain).await;
                self.cache.write().await.entry(key.clone()).or_insert(loaded);
            }
        }
        let mut cache = self.cache.write().await;
        let memory = cache.entry(key).or_insert_with(DomainMemory::empty);
        f(memory)
    }

    /// Records a completed trajectory and opportunistically distills a
    /// skill once `DISTILLATION_THRESHOLD` similar successful
    /// trajectories for the same page type exist (§4.10).
    pub async fn record_trajectory(&self, tenant: &TenantId, page_type: &str, trajectory: BrowsingTrajectory) {
        let domain = trajectory.domain.clone();
        let distilled = self
            .with_domain(tenant, &domain, |memory| {
                memory.trajectories.push(trajectory.clone());

                let similar: Vec<&BrowsingTrajectory> = memory
                    .trajectories
                    .iter()
                    .filter(|t| t.success && t.domain == domain)
                    .collect();

                if similar.len() >= DISTILLATION_THRESHOLD {
                    Some(distill_skill(&domain, page_type, &similar))
                } else {
                    None
                }
            })
            .await;

        if let Some(skill) = distilled {
            self.with_domain(tenant, &domain, |memory| {
                let already_have = memory.skills.iter().any(|s| s.page_type == skill.page_type && s.domain == skill.domain);
                if !already_have {
                    memory.skills.push(skill);
                }
            })
            .await;
        }

        let memory_snapshot = self.with_domain(tenant, &domain, |memory| DomainMemory {
            trajectories: memory.trajectories.clone(),
            skills: memory.skills.clone(),
        })
        .await;
        let _ = self.persist(tenant, &domain, &memory_snapshot).await;
    }

    /// Ranks known skills for `context` by the composite similarity
    /// score: page-type match (0.4) + selector overlap (0.3) + feature
    /// overlap (0.2) + embedding cosine if available (0.1), returning
    /// the top `top_k` (§4.10 `retrieve_skills`).
    pub async fn retrieve_skills(&self, tenant: &TenantId, context: &PageContext, top_k: usize, query_embedding: Option<&[f32]>) -> Vec<SkillMatch> {
        let domain = context.domain.clone();
        let mut matches = self
            .with_domain(tenant, &domain, |memory| {
                memory
                    .skills
                    .iter()
                    .map(|skill| score_skill(skill, context, query_embedding))
                    .collect::<Vec<_>>()
            })
            .await;
        matches.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
        matches.truncate(top_k);
        matches
    }

    pub async fn record_skill_execution(&self, tenant: &TenantId, domain: &str, skill_id: Uuid, success: bool, _duration_ms: u64) {
        let updated = self
            .with_domain(tenant, domain, |memory| {
                if let Some(skill) = memory.skills.iter_mut().find(|s| s.id == skill_id) {
                    skill.record_execution(success);
                    Some(DomainMemory {
                        trajectories: memory.trajectories.clone(),
                        skills: memory.skills.clone(),
                    })
                } else {
                    None
                }
            })
            .await;
        if let Some(memory) = updated {
            let _ = self.persist(tenant, domain, &memory).await;
        }
    }

    /// Executes a matched skill against a page handle surfaced by the
    /// caller as two async closures: `run_action` performs one action
    /// and reports success, `extract_available_selectors` refreshes
    /// selector visibility for subsequent preconditions. The first
    /// `navigate` action is skipped per §4.10 (the caller has already
    /// navigated). Critical actions (`click`/`fill`/`select`) abort the
    /// skill on failure; non-critical actions continue.
    pub async fn execute_skill<F, Fut>(&self, skill: &BrowsingSkill, mut run_action: F) -> SkillExecutionTrace
    where
        F: FnMut(BrowsingAction) -> Fut,
        Fut: std::future::Future<Output = (bool, u64, Option<String>)>,
    {
        let mut trace = SkillExecutionTrace {
            skill_id: Some(skill.id),
            actions_executed: 0,
            used_fallback: false,
            results: Vec::new(),
        };

        let mut skipped_navigate = false;
        for action in &skill.action_sequence {
            if !skipped_navigate && action.action_type == ActionType::Navigate {
                skipped_navigate = true;
                continue;
            }

            let (success, duration_ms, error) = run_action(action.clone()).await;
            trace.actions_executed += 1;
            trace.results.push(ActionResult {
                action_type: action.action_type,
                selector: action.selector.clone(),
                success,
                duration_ms,
                error: error.clone(),
            });

            if !success && action.action_type.is_critical() {
                trace.used_fallback = true;
                break;
            }
        }

        trace
    }

    pub async fn get_stats(&self, tenant: &TenantId, domains: &[String]) -> ProceduralMemoryStats {
        let mut stats = ProceduralMemoryStats::default();
        let mut usage: HashMap<String, u64> = HashMap::new();

        for domain in domains {
            let (trajectory_count, skills) = self
                .with_domain(tenant, domain, |memory| (memory.trajectories.len(), memory.skills.clone()))
                .await;
            stats.total_trajectories += trajectory_count;
            stats.per_domain_trajectory_counts.insert(domain.clone(), trajectory_count);
            stats.total_skills += skills.len();
            for skill in skills {
                usage.insert(skill.name.clone(), skill.uses);
            }
        }

        let mut most_used: Vec<(String, u64)> = usage.into_iter().collect();
        most_used.sort_by(|a, b| b.1.cmp(&a.1));
        most_used.truncate(10);
        stats.most_used_skills = most_used;
        stats
    }
}

fn score_skill(skill: &BrowsingSkill, context: &PageContext, query_embedding: Option<&[f32]>) -> SkillMatch {
    let page_type_score = if skill.page_type == page_type_str(context.page_type) { 1.0 } else { 0.0 };
    let selector_score = context.selector_overlap(&skill.preconditions.required_selectors);
    let feature_score = feature_overlap(&skill.preconditions.page_features, context);
    let embedding_score = match (skill.embedding.as_deref(), query_embedding) {
        (Some(a), Some(b)) => cosine_similarity(a, b),
        _ => 0.0,
    };

    let similarity = page_type_score * PAGE_TYPE_WEIGHT
        + selector_score * SELECTOR_OVERLAP_WEIGHT
        + feature_score * FEATURE_OVERLAP_WEIGHT
        + embedding_score * EMBEDDING_WEIGHT;

    let preconditions_met = selector_score >= 0.99;
    let reason = format!(
        "page_type={page_type_score:.1} selector_overlap={selector_score:.2} feature_overlap={feature_score:.2} embedding={embedding_score:.2}"
    );

    SkillMatch {
        skill: skill.clone(),
        similarity,
        preconditions_met,
        reason,
    }
}

fn page_type_str(page_type: crate::types::page_context::PageType) -> String {
    use crate::types::page_context::PageType;
    match page_type {
        PageType::Login => "login",
        PageType::Search => "search",
        PageType::Form => "form",
        PageType::List => "list",
        PageType::Detail => "detail",
        PageType::Unknown => "unknown",
    }
    .to_string()
}

fn feature_overlap(required_features: &[String], context: &PageContext) -> f32 {
    if required_features.is_empty() {
        return 1.0;
    }
    let mut present = 0usize;
    let available: Vec<&str> = {
        let mut features = Vec::new();
        if context.has_form {
            features.push("has_form");
        }
        if context.has_pagination {
            features.push("has_pagination");
        }
        if context.has_table {
            features.push("has_table");
        }
        features
    };
    for feature in required_features {
        if available.contains(&feature.as_str()) {
            present += 1;
        }
    }
    present as f32 / required_features.len() as f32
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

/// Longest-common-action-subsequence-style distillation: takes the
/// shortest successful trajectory's action types as the backbone,
/// generalising selectors by stripping any trailing numeric index
/// (§4.10 "selectors generalised by replacing numeric indices with
/// wildcards").
fn distill_skill(domain: &str, page_type: &str, trajectories: &[&BrowsingTrajectory]) -> BrowsingSkill {
    let backbone = trajectories
        .iter()
        .min_by_key(|t| t.actions.len())
        .expect("distillation requires at least one trajectory");

    let action_sequence: Vec<BrowsingAction> = backbone
        .actions
        .iter()
        .map(|action| BrowsingAction {
            action_type: action.action_type,
            selector: action.selector.as_deref().map(generalise_selector),
            url: action.url.clone(),
            value: action.value.clone(),
            wait_for: action.wait_for.clone(),
            timestamp: action.timestamp,
            success: action.success,
            duration_ms: action.duration_ms,
        })
        .collect();

    let required_selectors: Vec<String> = action_sequence.iter().filter_map(|a| a.selector.clone()).collect();

    BrowsingSkill {
        id: Uuid::now_v7(),
        name: format!("{domain}:{page_type}"),
        domain: domain.to_string(),
        page_type: page_type.to_string(),
        preconditions: SkillPreconditions {
            required_selectors,
            page_features: Vec::new(),
        },
        action_sequence,
        embedding: None,
        uses: 0,
        success_rate: 1.0,
    }
}

fn generalise_selector(selector: &str) -> String {
    match selector.rfind(|c: char| c.is_ascii_digit()) {
        Some(_) => {
            let trimmed: String = selector.chars().rev().skip_while(|c| c.is_ascii_digit()).collect::<String>().chars().rev().collect();
            if trimmed.len() == selector.len() {
                selector.to_string()
            } else {
                format!("{trimmed}*")
            }
        }
        None => selector.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::memory::MemoryKvStore;
    use crate::types::page_context::PageType;

    fn memory() -> ProceduralMemory<MemoryKvStore> {
        ProceduralMemory::new(std::sync::Arc::new(MemoryKvStore::new()))
    }

    fn successful_trajectory(domain: &str) -> BrowsingTrajectory {
        let mut trajectory = BrowsingTrajectory::new(domain, format!("https://{domain}/"));
        trajectory.success = true;
        trajectory.actions.push(BrowsingAction {
            action_type: ActionType::Navigate,
            selector: None,
            url: Some(format!("https://{domain}/")),
            value: None,
            wait_for: None,
            timestamp: Utc::now(),
            success: true,
            duration_ms: 10,
        });
        trajectory.actions.push(BrowsingAction {
            action_type: ActionType::Click,
            selector: Some(".item-3".to_string()),
            url: None,
            value: None,
            wait_for: None,
            timestamp: Utc::now(),
            success: true,
            duration_ms: 20,
        });
        trajectory
    }

    #[tokio::test]
    async fn distills_skill_after_threshold_successful_trajectories() {
        let memory = memory();
        let tenant = TenantId::new("t1");
        for _ in 0..DISTILLATION_THRESHOLD {
            memory.record_trajectory(&tenant, "detail", successful_trajectory("example.com")).await;
        }
        let context = PageContext::classify(
            "https://example.com/item".to_string(),
            "example.com".to_string(),
            None,
            vec![".item-3".to_string()],
            600,
            false,
            false,
            false,
        );
        let matches = memory.retrieve_skills(&tenant, &context, 5, None).await;
        assert_eq!(matches.len(), 1);
        assert!(matches[0].similarity > 0.0);
    }

    #[test]
    fn selector_generalisation_strips_trailing_index() {
        assert_eq!(generalise_selector(".item-3"), ".item-*");
        assert_eq!(generalise_selector(".item"), ".item");
    }

    #[tokio::test]
    async fn skill_execution_skips_first_navigate_and_aborts_on_critical_failure() {
        let skill = BrowsingSkill {
            id: Uuid::now_v7(),
            name: "test".into(),
            domain: "example.com".into(),
            page_type: "detail".into(),
            preconditions: SkillPreconditions::default(),
            action_sequence: vec![
                BrowsingAction {
                    action_type: ActionType::Navigate,
                    selector: None,
                    url: Some("https://example.com".into()),
                    value: None,
                    wait_for: None,
                    timestamp: Utc::now(),
                    success: true,
                    duration_ms: 0,
                },
                BrowsingAction {
                    action_type: ActionType::Click,
                    selector: Some(".buy".into()),
                    url: None,
                    value: None,
                    wait_for: None,
                    timestamp: Utc::now(),
                    success: true,
                    duration_ms: 0,
                },
                BrowsingAction {
                    action_type: ActionType::Extract,
                    selector: None,
                    url: None,
                    value: None,
                    wait_for: None,
                    timestamp: Utc::now(),
                    success: true,
                    duration_ms: 0,
                },
            ],
            embedding: None,
            uses: 0,
            success_rate: 1.0,
        };

        let memory = memory();
        let trace = memory
            .execute_skill(&skill, |action| async move {
                if action.action_type == ActionType::Click {
                    (false, 5, Some("not found".to_string()))
                } else {
                    (true, 5, None)
                }
            })
            .await;

        assert_eq!(trace.actions_executed, 1);
        assert!(trace.used_fallback);
    }
}
