//! Resolution policy seam.

use crate::query::{EndCode, Query};
use crate::resource::Resources;

/// Produces the record sections for a parsed question.
///
/// Contract: runs only for queries still undecided (`EndCode::Unknown`),
/// fills the answer/authority/additional arrays with records that stay
/// valid for the remainder of the loop iteration, and sets a final end
/// code. Implementations must not block.
pub trait Resolver: Send + Sync {
	fn resolve(&self, query: &mut Query, resources: &Resources);
}

/// The reference policy: every supported question gets A 127.0.0.1 (or the
/// loaded answer template) with the static nameserver and its glue.
pub struct StaticResolver;

impl Resolver for StaticResolver {
	fn resolve(&self, query: &mut Query, resources: &Resources) {
		query.answers.push(resources.answer.clone());
		query.authority.push(resources.authority.clone());
		query.additional.extend(resources.glue.iter().cloned());
		query.end_code = EndCode::NoError;
	}
}
