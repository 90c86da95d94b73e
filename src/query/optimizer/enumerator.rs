use crate::error::{Error, Result};
use crate::options::options::PlannerOptions;
use crate::query::canonical_query::CanonicalQuery;
use crate::query::optimizer::bounds::{leaf_bounds, KeyContext, LeafBounds};
use crate::query::physical_plan::{AccessPlan, IndexScan, PhysicalPlan};
use crate::query::{format_path, ComparisonOperator, Expr, Parameters, PathComponent, SortField, SortOrder};
use crate::storage::catalog::{CollectionMetadata, IndexMetadata, KeyKind};
use crate::storage::Direction;
use crate::util::collation::Collation;
use bson::doc;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// A predicate on a single field, taken from a `FieldFilters` conjunct.
#[derive(Debug, Clone)]
struct Leaf {
    path: Vec<PathComponent>,
    /// Dotted path, as used by key patterns.
    name: String,
    predicate: Arc<Expr>,
    /// Position of the conjunct and of the predicate within it.
    conjunct: usize,
    position: usize,
}

impl Leaf {
    fn id(&self) -> (usize, usize) {
        (self.conjunct, self.position)
    }

    fn is_equality(&self) -> bool {
        matches!(
            self.predicate.as_ref(),
            Expr::Comparison { operator: ComparisonOperator::Eq, .. }
                | Expr::ExprComparison { operator: ComparisonOperator::Eq, .. }
        )
    }
}

fn collect_leaves(conjuncts: &[Arc<Expr>]) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    for (conjunct, expr) in conjuncts.iter().enumerate() {
        if let Expr::FieldFilters { field, filters } = expr.as_ref() {
            if let Some(path) = field.field_path() {
                for (position, predicate) in filters.iter().enumerate() {
                    leaves.push(Leaf {
                        path: path.to_vec(),
                        name: format_path(path),
                        predicate: predicate.clone(),
                        conjunct,
                        position,
                    });
                }
            }
        }
    }
    leaves
}

/// Rebuilds the filter from the predicates the index bounds do not enforce.
fn residual_filter(conjuncts: &[Arc<Expr>], consumed: &HashSet<(usize, usize)>) -> Option<Arc<Expr>> {
    let mut remaining = Vec::with_capacity(conjuncts.len());
    for (i, conjunct) in conjuncts.iter().enumerate() {
        match conjunct.as_ref() {
            Expr::FieldFilters { field, filters } => {
                let kept: Vec<Arc<Expr>> = filters
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| !consumed.contains(&(i, *j)))
                    .map(|(_, f)| f.clone())
                    .collect();
                if kept.len() == filters.len() {
                    remaining.push(conjunct.clone());
                } else if !kept.is_empty() {
                    remaining.push(Arc::new(Expr::FieldFilters {
                        field: field.clone(),
                        filters: kept,
                    }));
                }
            }
            _ => remaining.push(conjunct.clone()),
        }
    }
    if remaining.is_empty() {
        None
    } else {
        Some(Expr::and_of(remaining))
    }
}

/// How an index can serve a filter.
#[derive(Debug)]
struct IndexAssignment {
    index: Arc<IndexMetadata>,
    field_predicates: Vec<Vec<Arc<Expr>>>,
    /// Predicates fully enforced by the bounds.
    consumed: HashSet<(usize, usize)>,
    /// Fields bounded by an equality on a single-valued field.
    equality_fields: Vec<bool>,
    bounded: bool,
    wildcard_path: Option<String>,
}

impl IndexAssignment {
    fn scan(&self, direction: Direction) -> IndexScan {
        let key_pattern = match &self.wildcard_path {
            Some(path) => {
                let mut key_pattern = doc! { "$_path": 1 };
                key_pattern.insert(path.clone(), 1);
                key_pattern
            }
            None => self.index.key_pattern.clone(),
        };
        IndexScan {
            index: self.index.index_ref(),
            key_pattern,
            field_predicates: self.field_predicates.clone(),
            wildcard_path: self.wildcard_path.clone(),
            direction,
        }
    }

    /// Direction in which a scan returns documents in `sort` order, if any.
    ///
    /// The sort fields must follow the equality prefix of the key pattern and
    /// their directions must all agree with the index, or all disagree.
    fn sort_direction(&self, sort: &[SortField], collation: &Collation) -> Option<Direction> {
        let index = &self.index;
        if index.is_wildcard() || !index.collation.matches(collation) || sort.is_empty() {
            return None;
        }
        let equality_prefix = self.equality_fields.iter().take_while(|e| **e).count();

        'start: for start in 0..=equality_prefix {
            if start + sort.len() > index.fields.len() {
                break;
            }
            let mut direction = None;
            for (offset, sort_field) in sort.iter().enumerate() {
                let position = start + offset;
                let field = &index.fields[position];
                if field.path != sort_field.path {
                    continue 'start;
                }
                if self.equality_fields[position] {
                    continue;
                }
                if field.kind == KeyKind::Hashed || index.multikey[position] {
                    continue 'start;
                }
                let forward = (sort_field.order == SortOrder::Ascending) == (field.kind == KeyKind::Ascending);
                let field_direction = if forward { Direction::Forward } else { Direction::Reverse };
                match direction {
                    Some(d) if d != field_direction => continue 'start,
                    _ => direction = Some(field_direction),
                }
            }
            return Some(direction.unwrap_or(Direction::Forward));
        }
        None
    }
}

/// A plan and the properties it provides.
#[derive(Debug)]
struct Candidate {
    plan: PhysicalPlan,
    provides_sort: bool,
}

impl Candidate {
    fn into_access_plan(self) -> AccessPlan {
        AccessPlan::new(self.plan, self.provides_sort)
    }
}

/// Produces the candidate access plans of a query.
///
/// Plans are returned in a stable order: single index plans in index name
/// order, index unions, index intersections and finally the collection scan,
/// which is always a valid fallback. A hinted query only gets plans reading
/// the hinted index.
pub struct PlanEnumerator<'a> {
    collection: &'a CollectionMetadata,
    query: &'a CanonicalQuery,
    options: &'a PlannerOptions,
}

impl<'a> PlanEnumerator<'a> {
    pub fn new(collection: &'a CollectionMetadata, query: &'a CanonicalQuery, options: &'a PlannerOptions) -> Self {
        PlanEnumerator {
            collection,
            query,
            options,
        }
    }

    pub fn enumerate(&self) -> Result<Vec<AccessPlan>> {
        let indexes = self.candidate_indexes()?;

        if matches!(self.query.filter.as_ref(), Expr::AlwaysFalse) {
            return Ok(vec![AccessPlan::new(PhysicalPlan::Eof, true)]);
        }

        let conjuncts = self.query.filter.conjuncts();
        let leaves = collect_leaves(&conjuncts);

        if let Some(key) = self.query.kind.distinct_key() {
            let distinct = self.distinct_plans(&indexes, &conjuncts, &leaves, key)?;
            if !distinct.is_empty() {
                return Ok(self.cap(distinct, None));
            }
        }

        let mut candidates = self.index_plans(&indexes, &conjuncts, &leaves)?;
        candidates.extend(self.or_plans(&indexes, &conjuncts)?);
        candidates.extend(self.and_sorted_plan(&indexes, &conjuncts, &leaves)?);

        if self.query.hint.is_some() {
            if candidates.is_empty() {
                return Ok(vec![self.hinted_full_scan(&indexes)?.into_access_plan()]);
            }
            return Ok(self.cap(candidates, None));
        }

        let collection_scan = Candidate {
            plan: PhysicalPlan::CollectionScan {
                direction: Direction::Forward,
                filter: match self.query.filter.as_ref() {
                    Expr::AlwaysTrue => None,
                    _ => Some(self.query.filter.clone()),
                },
            },
            provides_sort: false,
        };
        Ok(self.cap(candidates, Some(collection_scan)))
    }

    fn cap(&self, mut candidates: Vec<Candidate>, fallback: Option<Candidate>) -> Vec<AccessPlan> {
        let max = self.options.max_enumerated_plans().max(1);
        candidates.truncate(if fallback.is_some() { max - 1 } else { max });
        candidates.extend(fallback);
        candidates.into_iter().map(Candidate::into_access_plan).collect()
    }

    /// Indexes the planner may use, restricted to the hinted one if any.
    fn candidate_indexes(&self) -> Result<Vec<Arc<IndexMetadata>>> {
        match &self.query.hint {
            Some(name) => match self.collection.index(name) {
                Some(index) if !index.hidden => Ok(vec![index]),
                _ => Err(Error::InvalidRequest(format!(
                    "hint provided does not correspond to an existing index: {}",
                    name
                ))),
            },
            None => Ok(self.collection.visible_indexes().cloned().collect()),
        }
    }

    fn index_plans(
        &self,
        indexes: &[Arc<IndexMetadata>],
        conjuncts: &[Arc<Expr>],
        leaves: &[Leaf],
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for assignment in self.assignments(indexes, leaves)? {
            let direction = self
                .query
                .sort
                .as_deref()
                .and_then(|sort| assignment.sort_direction(sort, &self.query.collation));
            if !assignment.bounded && direction.is_none() {
                continue;
            }
            let plan = PhysicalPlan::Fetch {
                input: Arc::new(PhysicalPlan::IndexScan(
                    assignment.scan(direction.unwrap_or(Direction::Forward)),
                )),
                filter: residual_filter(conjuncts, &assignment.consumed),
            };
            candidates.push(Candidate {
                plan,
                provides_sort: direction.is_some(),
            });
        }
        Ok(candidates)
    }

    /// Assigns predicates to every usable index. Wildcard indexes get one
    /// assignment per path they can bound.
    fn assignments(&self, indexes: &[Arc<IndexMetadata>], leaves: &[Leaf]) -> Result<Vec<IndexAssignment>> {
        let mut assignments = Vec::new();
        for index in indexes {
            if !self.partial_filter_satisfied(index, leaves)? {
                continue;
            }
            if index.is_wildcard() {
                assignments.extend(self.wildcard_assignments(index, leaves)?);
            } else if let Some(assignment) = self.assign(index, leaves)? {
                assignments.push(assignment);
            }
        }
        Ok(assignments)
    }

    fn assign(&self, index: &Arc<IndexMetadata>, leaves: &[Leaf]) -> Result<Option<IndexAssignment>> {
        let mut field_predicates = Vec::with_capacity(index.fields.len());
        let mut consumed = HashSet::new();
        let mut equality_fields = Vec::with_capacity(index.fields.len());
        let mut bounded = false;
        let mut excludes_missing = false;

        for (position, field) in index.fields.iter().enumerate() {
            let key = KeyContext::for_field(index, position);
            let chosen = self.choose_leaves(
                leaves.iter().filter(|l| l.name == field.name),
                &key,
                index.multikey[position],
            )?;
            if position == 0 && field.kind == KeyKind::Hashed && chosen.is_empty() {
                // Unbounded hashed leading field
                return Ok(None);
            }
            bounded |= !chosen.is_empty();
            excludes_missing |= chosen.iter().any(|(_, b)| !b.matches_missing);
            equality_fields.push(
                field.kind != KeyKind::Hashed
                    && !index.multikey[position]
                    && chosen.iter().any(|(l, _)| l.is_equality()),
            );
            for (leaf, bounds) in &chosen {
                if bounds.tightness.is_exact() {
                    consumed.insert(leaf.id());
                }
            }
            field_predicates.push(chosen.into_iter().map(|(l, _)| l.predicate.clone()).collect());
        }

        if index.sparse && !excludes_missing {
            return Ok(None);
        }
        Ok(Some(IndexAssignment {
            index: index.clone(),
            field_predicates,
            consumed,
            equality_fields,
            bounded,
            wildcard_path: None,
        }))
    }

    fn wildcard_assignments(&self, index: &Arc<IndexMetadata>, leaves: &[Leaf]) -> Result<Vec<IndexAssignment>> {
        let spec = match &index.wildcard {
            Some(spec) => spec,
            None => return Ok(vec![]),
        };
        let paths: BTreeSet<&str> = leaves.iter().map(|l| l.name.as_str()).collect();
        let max_fields = if spec.projection.is_some() {
            self.options.max_wildcard_fields_with_projection()
        } else {
            self.options.max_wildcard_fields()
        };
        if paths.len() > max_fields {
            return Ok(vec![]);
        }

        let key = KeyContext::for_field(index, 1);
        let mut assignments = Vec::new();
        for path in paths {
            let positional = leaves
                .iter()
                .any(|l| l.name == path && l.path.iter().any(|c| matches!(c, PathComponent::ArrayElement(_))));
            if positional || !spec.covers(path) {
                continue;
            }
            let multikey = index.is_multikey_path(path);
            let chosen = self.choose_leaves(leaves.iter().filter(|l| l.name == path), &key, multikey)?;
            if chosen.is_empty() {
                continue;
            }
            let consumed = chosen
                .iter()
                .filter(|(_, b)| b.tightness.is_exact())
                .map(|(l, _)| l.id())
                .collect();
            assignments.push(IndexAssignment {
                index: index.clone(),
                field_predicates: vec![vec![], chosen.into_iter().map(|(l, _)| l.predicate.clone()).collect()],
                consumed,
                equality_fields: vec![false, false],
                bounded: true,
                wildcard_path: Some(path.to_string()),
            });
        }
        Ok(assignments)
    }

    /// Picks the predicates bounding one key field. Bounds of a multikey
    /// field come from a single predicate, as different elements of an array
    /// may satisfy different predicates.
    fn choose_leaves<'l>(
        &self,
        leaves: impl Iterator<Item = &'l Leaf>,
        key: &KeyContext,
        multikey: bool,
    ) -> Result<Vec<(&'l Leaf, LeafBounds)>> {
        let mut sargable = Vec::new();
        for leaf in leaves {
            if let Some(bounds) = leaf_bounds(&leaf.predicate, key, &self.query.parameters, &self.query.collation)? {
                sargable.push((leaf, bounds));
            }
        }
        if multikey && sargable.len() > 1 {
            let best = sargable.iter().position(|(_, b)| b.is_points()).unwrap_or(0);
            return Ok(vec![sargable.swap_remove(best)]);
        }
        Ok(sargable)
    }

    /// Returns `true` if every document matching the filter is indexed by a
    /// partial index. Only implications between comparisons on the same field
    /// and existence checks are recognized.
    fn partial_filter_satisfied(&self, index: &IndexMetadata, leaves: &[Leaf]) -> Result<bool> {
        let partial_filter = match &index.partial_filter {
            Some(filter) => filter,
            None => return Ok(true),
        };
        let no_parameters = Parameters::new();
        let key = KeyContext::plain(&index.collation);

        for conjunct in partial_filter.conjuncts() {
            let (path, filters) = match conjunct.as_ref() {
                Expr::FieldFilters { field, filters } => match field.field_path() {
                    Some(path) => (format_path(path), filters),
                    None => return Ok(false),
                },
                _ => return Ok(false),
            };
            let candidates: Vec<&Leaf> = leaves.iter().filter(|l| l.name == path).collect();

            for filter in filters {
                let implied = match filter.as_ref() {
                    Expr::Exists(true) => {
                        let mut implied = false;
                        for leaf in &candidates {
                            implied |= matches!(leaf.predicate.as_ref(), Expr::Exists(true))
                                || leaf_bounds(&leaf.predicate, &key, &self.query.parameters, &self.query.collation)?
                                    .is_some_and(|b| !b.matches_missing);
                        }
                        implied
                    }
                    Expr::Comparison { .. } => {
                        let required = match leaf_bounds(filter, &key, &no_parameters, &index.collation)? {
                            Some(bounds) if bounds.tightness.is_exact() => bounds,
                            _ => return Ok(false),
                        };
                        let mut implied = false;
                        for leaf in &candidates {
                            if !matches!(leaf.predicate.as_ref(), Expr::Comparison { .. }) {
                                continue;
                            }
                            if let Some(bounds) =
                                leaf_bounds(&leaf.predicate, &key, &self.query.parameters, &self.query.collation)?
                            {
                                implied |= bounds.tightness.is_exact()
                                    && bounds
                                        .intervals
                                        .iter()
                                        .all(|i| required.intervals.iter().any(|r| r.contains_interval(i)));
                            }
                        }
                        implied
                    }
                    _ => false,
                };
                if !implied {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Union plans for the first `$or` of the filter whose branches can all
    /// use an index.
    fn or_plans(&self, indexes: &[Arc<IndexMetadata>], conjuncts: &[Arc<Expr>]) -> Result<Vec<Candidate>> {
        let (or_position, branches) = match conjuncts
            .iter()
            .enumerate()
            .find_map(|(i, c)| match c.as_ref() {
                Expr::Or(branches) => Some((i, branches)),
                _ => None,
            }) {
            Some(found) => found,
            None => return Ok(vec![]),
        };

        let mut branch_plans: Vec<Vec<Candidate>> = Vec::with_capacity(branches.len());
        for branch in branches {
            let branch_conjuncts = branch.conjuncts();
            let branch_leaves = collect_leaves(&branch_conjuncts);
            let plans = self.index_plans(indexes, &branch_conjuncts, &branch_leaves)?;
            if plans.is_empty() {
                return Ok(vec![]);
            }
            branch_plans.push(plans);
        }

        let others: Vec<Arc<Expr>> = conjuncts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != or_position)
            .map(|(_, c)| c.clone())
            .collect();
        let filter = if others.is_empty() { None } else { Some(Expr::and_of(others)) };

        let mut candidates = Vec::new();
        let mut choice = vec![0; branch_plans.len()];
        let max = self.options.max_enumerated_plans();
        loop {
            let members: Vec<&Candidate> = choice.iter().zip(&branch_plans).map(|(c, plans)| &plans[*c]).collect();
            candidates.push(self.union(&members, filter.clone()));
            if candidates.len() >= max || !advance(&mut choice, &branch_plans) {
                break;
            }
        }
        Ok(candidates)
    }

    fn union(&self, members: &[&Candidate], filter: Option<Arc<Expr>>) -> Candidate {
        let sorted = self.query.sort.as_ref().filter(|_| members.iter().all(|m| m.provides_sort));
        let input = match sorted {
            Some(sort) => PhysicalPlan::SortMerge {
                sort: sort.clone(),
                inputs: members.iter().map(|m| Arc::new(m.plan.clone())).collect(),
            },
            None => PhysicalPlan::Or {
                inputs: members.iter().map(|m| Arc::new(unfetched(&m.plan))).collect(),
            },
        };
        Candidate {
            plan: PhysicalPlan::Fetch {
                input: Arc::new(input),
                filter,
            },
            provides_sort: sorted.is_some(),
        }
    }

    /// Intersection of the first two single field indexes bound by equalities
    /// on different fields.
    fn and_sorted_plan(
        &self,
        indexes: &[Arc<IndexMetadata>],
        conjuncts: &[Arc<Expr>],
        leaves: &[Leaf],
    ) -> Result<Option<Candidate>> {
        let assignments: Vec<IndexAssignment> = self
            .assignments(indexes, leaves)?
            .into_iter()
            .filter(|a| {
                a.wildcard_path.is_none()
                    && a.index.fields.len() == 1
                    && a.field_predicates[0].len() == 1
                    && leaves
                        .iter()
                        .any(|l| l.is_equality() && Arc::ptr_eq(&l.predicate, &a.field_predicates[0][0]))
            })
            .collect();

        for (i, first) in assignments.iter().enumerate() {
            for second in &assignments[i + 1..] {
                if first.index.fields[0].name == second.index.fields[0].name {
                    continue;
                }
                let consumed = first.consumed.union(&second.consumed).cloned().collect();
                let plan = PhysicalPlan::Fetch {
                    input: Arc::new(PhysicalPlan::AndSorted {
                        inputs: vec![
                            Arc::new(PhysicalPlan::IndexScan(first.scan(Direction::Forward))),
                            Arc::new(PhysicalPlan::IndexScan(second.scan(Direction::Forward))),
                        ],
                    }),
                    filter: residual_filter(conjuncts, &consumed),
                };
                return Ok(Some(Candidate {
                    plan,
                    provides_sort: false,
                }));
            }
        }
        Ok(None)
    }

    /// Plans reading one index entry per distinct value of `key`, without
    /// fetching documents.
    fn distinct_plans(
        &self,
        indexes: &[Arc<IndexMetadata>],
        conjuncts: &[Arc<Expr>],
        leaves: &[Leaf],
        key: &[PathComponent],
    ) -> Result<Vec<Candidate>> {
        if !self.query.collation.is_simple() {
            return Ok(vec![]);
        }
        let key_name = format_path(key);
        let mut candidates = Vec::new();
        for index in indexes {
            if index.sparse || index.partial_filter.is_some() || index.is_wildcard() || !index.collation.is_simple() {
                continue;
            }
            let position = match index.position_of(&key_name) {
                Some(position) => position,
                None => continue,
            };
            if index.fields[position].kind == KeyKind::Hashed || index.multikey[position] {
                continue;
            }
            let assignment = match self.assign(index, leaves)? {
                Some(assignment) => assignment,
                None => continue,
            };
            if !assignment.equality_fields[..position].iter().all(|e| *e)
                || residual_filter(conjuncts, &assignment.consumed).is_some()
            {
                continue;
            }
            let scan = PhysicalPlan::DistinctScan {
                scan: assignment.scan(Direction::Forward),
                distinct_position: position,
            };
            candidates.push(Candidate {
                plan: PhysicalPlan::CoveredProjection {
                    input: Arc::new(scan),
                    fields: vec![(key.to_vec(), position)],
                },
                provides_sort: false,
            });
        }
        Ok(candidates)
    }

    /// Reads the whole hinted index when it cannot bound the filter.
    fn hinted_full_scan(&self, indexes: &[Arc<IndexMetadata>]) -> Result<Candidate> {
        let index = match indexes.first() {
            Some(index) => index,
            None => return Err(Error::NoQueryPlan("No index to scan".to_string())),
        };
        if index.is_wildcard() {
            return Err(Error::NoQueryPlan(format!(
                "Hinted wildcard index {} cannot answer a query without predicate on the paths it covers",
                index.name
            )));
        }
        let assignment = IndexAssignment {
            index: index.clone(),
            field_predicates: vec![vec![]; index.fields.len()],
            consumed: HashSet::new(),
            equality_fields: vec![false; index.fields.len()],
            bounded: false,
            wildcard_path: None,
        };
        let direction = self
            .query
            .sort
            .as_deref()
            .and_then(|sort| assignment.sort_direction(sort, &self.query.collation));
        Ok(Candidate {
            plan: PhysicalPlan::Fetch {
                input: Arc::new(PhysicalPlan::IndexScan(
                    assignment.scan(direction.unwrap_or(Direction::Forward)),
                )),
                filter: match self.query.filter.as_ref() {
                    Expr::AlwaysTrue => None,
                    _ => Some(self.query.filter.clone()),
                },
            },
            provides_sort: direction.is_some(),
        })
    }
}

/// Branch of a union: a fetch without filter is left to the stage above.
fn unfetched(plan: &PhysicalPlan) -> PhysicalPlan {
    match plan {
        PhysicalPlan::Fetch { input, filter: None } => input.as_ref().clone(),
        other => other.clone(),
    }
}

/// Moves to the next combination of branch plans. Returns `false` once every
/// combination has been produced.
fn advance(choice: &mut [usize], branch_plans: &[Vec<Candidate>]) -> bool {
    for (c, plans) in choice.iter_mut().zip(branch_plans).rev() {
        *c += 1;
        if *c < plans.len() {
            return true;
        }
        *c = 0;
    }
    false
}

/// For each visible partial index, whether the filter guarantees that the
/// documents it matches are indexed.
pub fn partial_index_eligibility(
    collection: &CollectionMetadata,
    query: &CanonicalQuery,
    options: &PlannerOptions,
) -> Result<Vec<(String, bool)>> {
    let enumerator = PlanEnumerator::new(collection, query, options);
    let leaves = collect_leaves(&query.filter.conjuncts());
    let mut eligibility = Vec::new();
    for index in collection.visible_indexes().filter(|i| i.partial_filter.is_some()) {
        eligibility.push((index.name.clone(), enumerator.partial_filter_satisfied(index, &leaves)?));
    }
    Ok(eligibility)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::logger::test_instance;
    use crate::query::canonical_query::{parse_key, FindCommand, QueryKind};
    use crate::query::optimizer::optimizer::Optimizer;
    use crate::query::physical_plan::summary;
    use crate::storage::catalog::IndexOptions;
    use bson::Document;

    fn collection(indexes: Vec<(Document, IndexOptions)>) -> CollectionMetadata {
        indexes
            .into_iter()
            .fold(CollectionMetadata::new(10, "c"), |collection, (keys, options)| {
                collection.add_index(IndexMetadata::new(&keys, &options).unwrap())
            })
    }

    fn query(command: FindCommand, kind: QueryKind) -> CanonicalQuery {
        CanonicalQuery::new("db.c", &command, kind, &Optimizer::new(test_instance())).unwrap()
    }

    fn find(filter: Document) -> CanonicalQuery {
        query(FindCommand { filter, ..FindCommand::default() }, QueryKind::Find)
    }

    fn plans(collection: &CollectionMetadata, query: &CanonicalQuery) -> Vec<String> {
        PlanEnumerator::new(collection, query, &PlannerOptions::default())
            .enumerate()
            .unwrap()
            .iter()
            .map(|p| summary(&p.root))
            .collect()
    }

    fn plain(keys: Document) -> (Document, IndexOptions) {
        (keys, IndexOptions::default())
    }

    #[test]
    fn test_collection_scan_only() {
        let collection = collection(vec![plain(doc! { "a": 1 })]);
        assert_eq!(plans(&collection, &find(doc! { "b": 1 })), vec!["COLLSCAN"]);
        assert_eq!(plans(&collection, &find(doc! {})), vec!["COLLSCAN"]);
    }

    #[test]
    fn test_false_filter_is_eof() {
        let collection = collection(vec![plain(doc! { "a": 1 })]);
        assert_eq!(plans(&collection, &find(doc! { "a": { "$in": [] } })), vec!["EOF"]);
    }

    #[test]
    fn test_one_plan_per_relevant_index() {
        let collection = collection(vec![
            plain(doc! { "a": 1 }),
            plain(doc! { "b": 1, "a": 1 }),
            plain(doc! { "c": 1 }),
        ]);
        assert_eq!(
            plans(&collection, &find(doc! { "a": 1 })),
            vec!["FETCH(IXSCAN a_1)", "FETCH(IXSCAN b_1_a_1)", "COLLSCAN"]
        );
    }

    #[test]
    fn test_residual_filter() {
        let collection = collection(vec![plain(doc! { "a": 1 })]);
        let query = find(doc! { "a": { "$gt": 1 }, "b": 2 });
        let plans = PlanEnumerator::new(&collection, &query, &PlannerOptions::default())
            .enumerate()
            .unwrap();
        match plans[0].root.as_ref() {
            PhysicalPlan::Fetch { filter: Some(filter), .. } => {
                assert_eq!(filter.conjuncts().len(), 1);
                assert!(matches!(filter.as_ref(), Expr::FieldFilters { .. }));
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_hashed_leading_field_needs_an_equality() {
        let collection = collection(vec![plain(doc! { "a": "hashed", "b": 1 })]);
        assert_eq!(plans(&collection, &find(doc! { "a": { "$gt": 1 }, "b": 1 })), vec!["COLLSCAN"]);
        assert_eq!(
            plans(&collection, &find(doc! { "a": 1 })),
            vec!["FETCH(IXSCAN a_hashed_b_1)", "COLLSCAN"]
        );
    }

    #[test]
    fn test_sparse_index_needs_existing_field() {
        let collection = collection(vec![(doc! { "a": 1 }, IndexOptions::default().sparse())]);
        assert_eq!(plans(&collection, &find(doc! { "a": null })), vec!["COLLSCAN"]);
        assert_eq!(plans(&collection, &find(doc! { "a": 1 })), vec!["FETCH(IXSCAN a_1)", "COLLSCAN"]);
        assert_eq!(
            plans(&collection, &find(doc! { "a": { "$exists": true } })),
            vec!["FETCH(IXSCAN a_1)", "COLLSCAN"]
        );
    }

    #[test]
    fn test_partial_index_needs_implied_filter() {
        let options = IndexOptions::default().with_partial_filter(doc! { "a": { "$gt": 5 } });
        let collection = collection(vec![(doc! { "a": 1 }, options)]);
        assert_eq!(plans(&collection, &find(doc! { "a": 7 })), vec!["FETCH(IXSCAN a_1)", "COLLSCAN"]);
        assert_eq!(
            plans(&collection, &find(doc! { "a": { "$gte": 6, "$lt": 9 } })),
            vec!["FETCH(IXSCAN a_1)", "COLLSCAN"]
        );
        assert_eq!(plans(&collection, &find(doc! { "a": 3 })), vec!["COLLSCAN"]);
        assert_eq!(plans(&collection, &find(doc! { "a": { "$gt": 4 } })), vec!["COLLSCAN"]);
    }

    #[test]
    fn test_or_needs_every_branch_indexed() {
        let collection = collection(vec![plain(doc! { "a": 1 }), plain(doc! { "b": 1 })]);
        assert_eq!(
            plans(&collection, &find(doc! { "$or": [{ "a": 1 }, { "b": 2 }] })),
            vec!["FETCH(OR(IXSCAN a_1, IXSCAN b_1))", "COLLSCAN"]
        );
        assert_eq!(
            plans(&collection, &find(doc! { "$or": [{ "a": 1 }, { "c": 2 }] })),
            vec!["COLLSCAN"]
        );
    }

    #[test]
    fn test_or_with_literal_branches() {
        let collection = collection(vec![plain(doc! { "a": 1 })]);
        assert_eq!(
            plans(&collection, &find(doc! { "$or": [{ "a": 1 }, { "$expr": false }] })),
            vec!["FETCH(IXSCAN a_1)", "COLLSCAN"]
        );
        assert_eq!(
            plans(&collection, &find(doc! { "$or": [{ "a": 1 }, { "$expr": true }] })),
            vec!["COLLSCAN"]
        );
    }

    #[test]
    fn test_sort_provided_by_index() {
        let collection = collection(vec![plain(doc! { "a": 1, "b": -1 })]);
        let command = FindCommand {
            filter: doc! { "a": 1 },
            sort: Some(doc! { "b": 1 }),
            ..FindCommand::default()
        };
        let query = query(command, QueryKind::Find);
        let plans = PlanEnumerator::new(&collection, &query, &PlannerOptions::default())
            .enumerate()
            .unwrap();
        assert!(plans[0].provides_sort);
        assert_eq!(plans[0].root.index_scans()[0].direction, Direction::Reverse);
        assert!(!plans[1].provides_sort);
    }

    #[test]
    fn test_sort_only_index_plan() {
        let collection = collection(vec![plain(doc! { "a": 1 })]);
        let command = FindCommand {
            sort: Some(doc! { "a": -1 }),
            ..FindCommand::default()
        };
        let query = query(command, QueryKind::Find);
        let plans = PlanEnumerator::new(&collection, &query, &PlannerOptions::default())
            .enumerate()
            .unwrap();
        assert_eq!(plans.len(), 2);
        assert!(plans[0].provides_sort);
    }

    #[test]
    fn test_sort_merge_of_sorted_branches() {
        let collection = collection(vec![plain(doc! { "a": 1, "c": 1 }), plain(doc! { "b": 1, "c": 1 })]);
        let command = FindCommand {
            filter: doc! { "$or": [{ "a": 1 }, { "b": 2 }] },
            sort: Some(doc! { "c": 1 }),
            ..FindCommand::default()
        };
        let query = query(command, QueryKind::Find);
        assert_eq!(
            plans(&collection, &query),
            vec!["FETCH(SORT_MERGE(FETCH(IXSCAN a_1_c_1), FETCH(IXSCAN b_1_c_1)))", "COLLSCAN"]
        );
    }

    #[test]
    fn test_and_sorted_intersection() {
        let collection = collection(vec![plain(doc! { "a": 1 }), plain(doc! { "b": 1 })]);
        assert_eq!(
            plans(&collection, &find(doc! { "a": 1, "b": 2 })),
            vec![
                "FETCH(IXSCAN a_1)",
                "FETCH(IXSCAN b_1)",
                "FETCH(AND_SORTED(IXSCAN a_1, IXSCAN b_1))",
                "COLLSCAN"
            ]
        );
    }

    #[test]
    fn test_multikey_field_uses_one_predicate() {
        let base = collection(vec![plain(doc! { "a": 1 })]);
        let index = base.index("a_1").unwrap();
        let collection = base.replace_index(index.with_multikey(&[true], &BTreeSet::new()), true);
        let query = find(doc! { "a": { "$gt": 1, "$lt": 5 } });
        let plans = PlanEnumerator::new(&collection, &query, &PlannerOptions::default())
            .enumerate()
            .unwrap();
        let scan = plans[0].root.index_scans()[0].clone();
        assert_eq!(scan.field_predicates[0].len(), 1);
        assert!(matches!(plans[0].root.as_ref(), PhysicalPlan::Fetch { filter: Some(_), .. }));
    }

    #[test]
    fn test_wildcard_index() {
        let collection = collection(vec![plain(doc! { "$**": 1 })]);
        let query = find(doc! { "a.b": 1, "c": { "$gt": 2 } });
        let plans = PlanEnumerator::new(&collection, &query, &PlannerOptions::default())
            .enumerate()
            .unwrap();
        let paths: Vec<Option<String>> = plans
            .iter()
            .flat_map(|p| p.root.index_scans())
            .map(|s| s.wildcard_path.clone())
            .collect();
        assert_eq!(paths, vec![Some("a.b".to_string()), Some("c".to_string())]);

        let options = PlannerOptions::default().with_max_wildcard_fields(1);
        let plans = PlanEnumerator::new(&collection, &query, &options).enumerate().unwrap();
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn test_hint() {
        let collection = collection(vec![plain(doc! { "a": 1 }), plain(doc! { "b": 1 })]);
        let command = FindCommand {
            filter: doc! { "a": 1 },
            hint: Some("b_1".to_string()),
            ..FindCommand::default()
        };
        let hinted = query(command.clone(), QueryKind::Find);
        assert_eq!(plans(&collection, &hinted), vec!["FETCH(IXSCAN b_1)"]);

        let unknown = query(FindCommand { hint: Some("z_1".to_string()), ..command }, QueryKind::Find);
        assert!(PlanEnumerator::new(&collection, &unknown, &PlannerOptions::default())
            .enumerate()
            .is_err());
    }

    #[test]
    fn test_distinct_scan_on_prefix() {
        let collection = collection(vec![plain(doc! { "a": 1, "b": "hashed" })]);
        let distinct = |key: &str| {
            query(
                FindCommand::default(),
                QueryKind::Distinct { key: parse_key(key).unwrap() },
            )
        };
        assert_eq!(
            plans(&collection, &distinct("a")),
            vec!["PROJECTION_COVERED(DISTINCT_SCAN a_1_b_hashed)"]
        );
        assert_eq!(plans(&collection, &distinct("b")), vec!["COLLSCAN"]);
        assert_eq!(plans(&collection, &distinct("c")), vec!["COLLSCAN"]);
    }

    #[test]
    fn test_distinct_scan_requires_exact_filter() {
        let collection = collection(vec![plain(doc! { "a": 1, "b": "hashed" })]);
        let command = FindCommand {
            filter: doc! { "b": 5 },
            ..FindCommand::default()
        };
        let query = query(command, QueryKind::Distinct { key: parse_key("a").unwrap() });
        assert_eq!(plans(&collection, &query), vec!["FETCH(IXSCAN a_1_b_hashed)", "COLLSCAN"]);
    }

    #[test]
    fn test_enumeration_cap() {
        let collection = collection(vec![
            plain(doc! { "a": 1 }),
            plain(doc! { "a": 1, "b": 1 }),
            plain(doc! { "a": 1, "c": 1 }),
        ]);
        let query = find(doc! { "a": 1 });
        let options = PlannerOptions::default().with_max_enumerated_plans(2);
        let plans: Vec<String> = PlanEnumerator::new(&collection, &query, &options)
            .enumerate()
            .unwrap()
            .iter()
            .map(|p| summary(&p.root))
            .collect();
        assert_eq!(plans, vec!["FETCH(IXSCAN a_1)", "COLLSCAN"]);
    }
}
