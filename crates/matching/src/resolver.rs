use std::cmp::Ordering;
use std::fmt::Debug;
use std::future::Future;

use carebill_core::{Agency, AgencyId, Clinician, ClinicianId, Patient, PatientId};

use crate::similarity::similarity;
use crate::util::normalize;

/// Minimum similarity for a fuzzy match. Fixed, not configurable.
pub const FUZZY_THRESHOLD: f64 = 0.70;

/// A registry entry that extracted names can be matched against.
pub trait Resolvable {
    type Id: Copy + Ord + Debug;

    fn id(&self) -> Self::Id;
    fn name(&self) -> &str;
    fn is_active(&self) -> bool;
}

impl Resolvable for Agency {
    type Id = AgencyId;

    fn id(&self) -> AgencyId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

impl Resolvable for Clinician {
    type Id = ClinicianId;

    fn id(&self) -> ClinicianId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

impl Resolvable for Patient {
    type Id = PatientId;

    fn id(&self) -> PatientId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a, T> {
    Exact(&'a T),
    Fuzzy { entity: &'a T, score: f64 },
    NoMatch,
}

impl<'a, T> Resolution<'a, T> {
    pub fn entity(&self) -> Option<&'a T> {
        match *self {
            Resolution::Exact(entity) | Resolution::Fuzzy { entity, .. } => Some(entity),
            Resolution::NoMatch => None,
        }
    }
}

/// Matches `extracted` against `registry`.
///
/// An exact case-insensitive name match wins outright and may hit inactive
/// entries. Otherwise the active entry with the highest similarity is taken
/// when it reaches [`FUZZY_THRESHOLD`]. Equal scores go to the smallest
/// normalized name, then the smallest id, so the result does not depend on
/// the order the registry was loaded in.
pub fn resolve<'a, T: Resolvable>(registry: &'a [T], extracted: &str) -> Resolution<'a, T> {
    let wanted = normalize(extracted);
    if wanted.is_empty() {
        return Resolution::NoMatch;
    }

    let exact = registry
        .iter()
        .filter(|e| normalize(e.name()) == wanted)
        .min_by(|a, b| {
            b.is_active()
                .cmp(&a.is_active())
                .then_with(|| a.id().cmp(&b.id()))
        });
    if let Some(entity) = exact {
        return Resolution::Exact(entity);
    }

    let best = registry
        .iter()
        .filter(|e| e.is_active())
        .map(|e| (e, normalize(e.name()), similarity(&wanted, e.name())))
        .min_by(|(ea, na, sa), (eb, nb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| na.cmp(nb))
                .then_with(|| ea.id().cmp(&eb.id()))
        });

    match best {
        Some((entity, _, score)) if score >= FUZZY_THRESHOLD => Resolution::Fuzzy { entity, score },
        _ => Resolution::NoMatch,
    }
}

/// Persistence behind one entity kind. `create_or_fetch` must be atomic on the
/// normalized name: concurrent callers creating the same name get one row.
pub trait Registry {
    type Entity: Resolvable + Clone + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    fn candidates(&self) -> impl Future<Output = Result<Vec<Self::Entity>, Self::Error>> + Send;

    fn create_or_fetch(&self, name: &str) -> impl Future<Output = Result<Self::Entity, Self::Error>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<T> {
    Exact(T),
    Fuzzy { entity: T, score: f64 },
    Created(T),
}

impl<T> Resolved<T> {
    pub fn entity(&self) -> &T {
        match self {
            Resolved::Exact(e) | Resolved::Fuzzy { entity: e, .. } | Resolved::Created(e) => e,
        }
    }

    pub fn into_entity(self) -> T {
        match self {
            Resolved::Exact(e) | Resolved::Fuzzy { entity: e, .. } | Resolved::Created(e) => e,
        }
    }

    /// True when an existing entry was found rather than created.
    pub fn is_match(&self) -> bool {
        !matches!(self, Resolved::Created(_))
    }
}

/// Exact, then fuzzy, then create. Shared by every entity kind so the three
/// call sites cannot drift apart. Blank names resolve to `None`.
pub async fn resolve_or_create<R: Registry>(
    registry: &R,
    extracted: &str,
) -> Result<Option<Resolved<R::Entity>>, R::Error> {
    let name = extracted.trim();
    if name.is_empty() {
        return Ok(None);
    }

    let candidates = registry.candidates().await?;
    let outcome = match resolve(&candidates, name) {
        Resolution::Exact(entity) => Resolved::Exact(entity.clone()),
        Resolution::Fuzzy { entity, score } => {
            tracing::debug!(extracted = name, matched = entity.name(), score, "Fuzzy match");
            Resolved::Fuzzy {
                entity: entity.clone(),
                score,
            }
        }
        Resolution::NoMatch => {
            // A concurrent writer may have won the insert; either way one row exists.
            let entity = registry.create_or_fetch(name).await?;
            tracing::info!(name, id = ?entity.id(), "No registry match, using new entry");
            Resolved::Created(entity)
        }
    };
    Ok(Some(outcome))
}
