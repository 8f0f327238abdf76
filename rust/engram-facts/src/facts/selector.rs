#![allow(private_bounds)]

//! Domain module for the [`FactSelector`]

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Entity, EngramFactsError, MediaType, Reference};

/// A marker type that represents a totally open-ended [`FactSelector`]
#[derive(Clone)]
pub struct Unconstrained;
impl FactSelectorState for Unconstrained {}

/// A marker type that represents a [`FactSelector`] that is constrained by
/// at least the entity or media type of a fact.
#[derive(Debug, Clone)]
pub struct Constrained;
impl FactSelectorState for Constrained {}

trait FactSelectorState {}

/// The basic query system for selecting facts from a space. You can assign
/// its fields directly, but for convenience and ergonomics it is also
/// possible to construct it incrementally with the `the`, `of` and `since`
/// methods.
///
/// When a field is specified, all facts that are selected will share the
/// same field value. A selector that leaves `of` open is a *wildcard* over
/// entities; subscription graph expansion grows such selectors as linked
/// entities are discovered.
#[derive(Debug, Clone)]
pub struct FactSelector<State>
where
    State: FactSelectorState,
{
    entity: Option<Entity>,
    media_type: Option<MediaType>,
    since: Option<i64>,
    state_type: PhantomData<State>,
}

impl Default for FactSelector<Unconstrained> {
    fn default() -> Self {
        Self::new()
    }
}

impl FactSelector<Unconstrained> {
    /// Construct a new, unconstrained [`FactSelector`]. It will need to be
    /// constrained (by configuring at least an entity or media type) before
    /// it can be used.
    pub fn new() -> Self {
        Self {
            entity: None,
            media_type: None,
            since: None,
            state_type: PhantomData,
        }
    }
}

impl<State> FactSelector<State>
where
    State: FactSelectorState,
{
    /// The [`Entity`] that selected facts should be about
    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    /// The [`MediaType`] of any selected facts
    pub fn media_type(&self) -> Option<&MediaType> {
        self.media_type.as_ref()
    }

    /// The lowest commit version of interest, if any
    pub fn since(&self) -> Option<i64> {
        self.since
    }

    /// Set the [`MediaType`] field of the [`FactSelector`]
    pub fn the(self, media_type: MediaType) -> FactSelector<Constrained> {
        FactSelector::<Constrained> {
            media_type: Some(media_type),
            entity: self.entity,
            since: self.since,
            state_type: PhantomData,
        }
    }

    /// Set the [`Entity`] field of the [`FactSelector`]
    pub fn of(self, entity: Entity) -> FactSelector<Constrained> {
        FactSelector::<Constrained> {
            media_type: self.media_type,
            entity: Some(entity),
            since: self.since,
            state_type: PhantomData,
        }
    }

    /// Restrict selection to facts at or above the given commit version
    pub fn at_least(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }
}

impl From<FactSelector<Constrained>> for QuerySelector {
    fn from(selector: FactSelector<Constrained>) -> Self {
        QuerySelector {
            of: selector.entity,
            the: selector.media_type,
            since: selector.since,
        }
    }
}

/// The wire form of a selector: the subset of fields a remote can constrain
/// a query or subscription by. Open fields select everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySelector {
    /// The [`Entity`] to select, if constrained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub of: Option<Entity>,
    /// The [`MediaType`] to select, if constrained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub the: Option<MediaType>,
    /// The lowest commit version of interest, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

impl QuerySelector {
    /// Whether a fact stored under `(of, the)` matches this selector
    pub fn matches(&self, of: &Entity, the: &MediaType) -> bool {
        self.of.as_ref().is_none_or(|entity| entity == of)
            && self.the.as_ref().is_none_or(|media_type| media_type == the)
    }

    /// The deduplication digest of this selector: equal canonical selectors
    /// collapse onto one in-flight query and reuse one server subscription
    pub fn digest(&self) -> Result<Reference, EngramFactsError> {
        Reference::of(self)
    }
}

/// A [`SchemaSelector`] pairs a wire selector with the JSON schema that
/// guides server-side reactive queries and client-side subscription graph
/// expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSelector {
    /// The wire selector
    pub select: QuerySelector,
    /// The schema guiding traversal of selected values
    pub schema: Value,
}

impl SchemaSelector {
    /// The deduplication digest of this schema selector
    pub fn digest(&self) -> Result<Reference, EngramFactsError> {
        Reference::of(self)
    }
}
