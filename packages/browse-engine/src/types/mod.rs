//! Domain-agnostic data model (§3). Entities are flat, id-keyed structs —
//! no cyclic references (§9 "Cyclic references... Store entities in a
//! flat map keyed by id").

pub mod api_pattern;
pub mod browse_result;
pub mod decision_trace;
pub mod domain_entry;
pub mod page_context;
pub mod request;
pub mod trajectory;
pub mod url;

pub use api_pattern::ApiPattern;
pub use browse_result::{BrowseResult, FieldConfidence, FieldSource, NetworkRequest};
pub use decision_trace::{DecisionTrace, SelectorAttempt, TierAttempt, TitleAttempt, Validation};
pub use domain_entry::{DomainEntry, FailureReport, PaginationPattern, SelectorPattern};
pub use page_context::{PageContext, PageType};
pub use request::{BrowseOptions, FreshnessRequirement, RenderTier, Request, VerifyMode};
pub use trajectory::{ActionType, BrowsingAction, BrowsingSkill, BrowsingTrajectory};
pub use url::{ParsedUrl, TenantId};
