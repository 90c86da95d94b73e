use crate::error::{Error, Result};
use crate::event;
use crate::obs::logger::LoggerAndTracer;
use crate::obs::metrics::PlannerMetrics;
use crate::options::options::PlannerOptions;
use crate::query::execution::plan_executor::PlanExecutor;
use crate::query::execution::stage::{StageState, StageStats};
use crate::query::physical_plan::{summary, AccessPlan};
use std::cmp::Ordering;
use std::sync::Arc;

/// A candidate plan and the executor running it.
pub struct Candidate {
    pub access: AccessPlan,
    pub executor: PlanExecutor,
}

/// How a candidate performed during its trial.
#[derive(Debug, Clone)]
pub struct TrialResult {
    pub access: AccessPlan,
    pub results: usize,
    pub works: u64,
    pub is_eof: bool,
    pub stats: StageStats,
    /// Why the candidate was disqualified, if it was.
    pub error: Option<String>,
}

impl TrialResult {
    fn rank(&self, other: &TrialResult) -> Ordering {
        other
            .is_eof
            .cmp(&self.is_eof)
            .then_with(|| other.results.cmp(&self.results))
            .then_with(|| self.works.cmp(&other.works))
    }
}

/// The winning candidate, with the results it produced during the trial
/// still buffered in its executor.
pub struct Ranking {
    pub winner: Candidate,
    pub winner_result: TrialResult,
    /// Every other candidate, in enumeration order.
    pub rejected: Vec<TrialResult>,
}

/// Runs candidate plans side by side and picks the most productive one.
///
/// Candidates are worked round-robin. The trial ends as soon as one of them
/// reaches EOF or produces `max_results` documents, or once every candidate
/// spent `trial_max_works` works. Plans failing during the trial are
/// disqualified; an interrupt stops the whole trial.
pub struct MultiPlanner<'a> {
    options: &'a PlannerOptions,
    metrics: Arc<PlannerMetrics>,
    logger: Arc<dyn LoggerAndTracer>,
}

struct Contender {
    candidate: Candidate,
    results: usize,
    error: Option<Error>,
}

impl<'a> MultiPlanner<'a> {
    pub fn new(options: &'a PlannerOptions, metrics: Arc<PlannerMetrics>, logger: Arc<dyn LoggerAndTracer>) -> Self {
        MultiPlanner { options, metrics, logger }
    }

    /// Number of results ending a trial, at most the query limit.
    pub fn max_results(&self, limit: Option<usize>) -> usize {
        let max = self.options.trial_max_results();
        limit.map_or(max, |l| l.min(max)).max(1)
    }

    pub fn pick_best(&self, candidates: Vec<Candidate>, max_results: usize) -> Result<Ranking> {
        self.metrics.multiplanner_trials.inc();
        let mut contenders: Vec<Contender> = candidates
            .into_iter()
            .map(|candidate| Contender {
                candidate,
                results: 0,
                error: None,
            })
            .collect();

        let mut round = 0;
        'trial: while round < self.options.trial_max_works() {
            round += 1;
            let mut active = 0;
            for contender in contenders.iter_mut().filter(|c| c.error.is_none()) {
                active += 1;
                match contender.candidate.executor.work() {
                    Ok(StageState::Advanced(member)) => {
                        contender.candidate.executor.buffer(member);
                        contender.results += 1;
                        if contender.results >= max_results {
                            break 'trial;
                        }
                    }
                    Ok(StageState::NeedTime) => (),
                    Ok(StageState::IsEof) => break 'trial,
                    Err(e @ Error::Interrupted(_)) => return Err(e),
                    Err(e) => {
                        event!(
                            self.logger,
                            "event: candidate disqualified, plan={}, error={}",
                            summary(&contender.candidate.access.root),
                            e
                        );
                        contender.error = Some(e);
                    }
                }
            }
            if active == 0 {
                break;
            }
        }

        let results: Vec<TrialResult> = contenders
            .iter()
            .map(|c| TrialResult {
                access: c.candidate.access.clone(),
                results: c.results,
                works: c.candidate.executor.works(),
                is_eof: c.candidate.executor.is_eof(),
                stats: c.candidate.executor.stats(),
                error: c.error.as_ref().map(|e| e.to_string()),
            })
            .collect();

        let winner = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.error.is_none())
            .min_by(|(i, a), (j, b)| a.rank(b).then_with(|| i.cmp(j)))
            .map(|(i, _)| i);

        let winner = match winner {
            Some(winner) => winner,
            None => return Err(all_disqualified(contenders)),
        };

        event!(
            self.logger,
            "event: multiplanning done, candidates={}, winner={}, works={}, results={}",
            results.len(),
            summary(&results[winner].access.root),
            results[winner].works,
            results[winner].results
        );

        let mut rejected = Vec::with_capacity(results.len() - 1);
        let mut winner_result = None;
        for (i, result) in results.into_iter().enumerate() {
            if i == winner {
                winner_result = Some(result);
            } else {
                rejected.push(result);
            }
        }
        let winner_result =
            winner_result.ok_or_else(|| Error::UnexpectedError("Multiplanning lost its winner".to_string()))?;
        let winner = contenders.swap_remove(winner).candidate;
        Ok(Ranking {
            winner,
            winner_result,
            rejected,
        })
    }
}

/// A query killed by a catalog change is reported as such, anything else
/// failing every candidate is a resource problem.
fn all_disqualified(contenders: Vec<Contender>) -> Error {
    let mut errors = contenders.into_iter().filter_map(|c| c.error);
    match errors.next() {
        Some(Error::QueryPlanKilled(message)) => Error::QueryPlanKilled(message),
        Some(first) => Error::ResourceExhausted(format!("Every candidate plan failed during multiplanning: {}", first)),
        None => Error::NoQueryPlan("No candidate plan to rank".to_string()),
    }
}
