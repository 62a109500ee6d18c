//! Suite partitioning across available IUTs.
//!
//! The splitter distributes a suite's recipes over the checked-out IUTs so
//! that parallelism is maximized without starving any test runner: IUTs are
//! handed out proportionally to each runner's share of the total recipe
//! count, with a guaranteed minimum of one IUT for every runner that holds
//! at least one recipe.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::provider::Resource;
use crate::suite::{RunnerSlot, TestRunner};

/// Result type for splitter operations.
pub type SplitResult<T> = Result<T, SplitError>;

/// Errors that can occur while partitioning a suite.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("No IUTs available to assign to test runners")]
    NoCapacity,
}

/// Partitions test runners' recipes across available IUTs.
pub struct Splitter {
    total_test_count: usize,
}

impl Splitter {
    /// Create a splitter for a suite with the given total recipe count.
    pub fn new(total_test_count: usize) -> Self {
        Self { total_test_count }
    }

    /// Assign IUTs to each test runner holding recipes.
    ///
    /// Each such runner receives a proportional share of the IUT pool,
    /// floor-rounded, never below one and never above its recipe count;
    /// leftover IUTs go out by largest remainder. When runners outnumber
    /// IUTs, handles are shared in sequence instead of leaving a runner
    /// with zero. Runners with no recipes are not scheduled at all.
    ///
    /// Returns the IUTs that were not assigned to any runner, for the
    /// caller to check back in.
    pub fn assign_iuts(
        &self,
        runners: &mut BTreeMap<String, TestRunner>,
        iuts: Vec<Resource>,
    ) -> SplitResult<Vec<Resource>> {
        if iuts.is_empty() {
            return Err(SplitError::NoCapacity);
        }
        let number_of_iuts = iuts.len();
        let total = if self.total_test_count > 0 {
            self.total_test_count
        } else {
            runners.values().map(|r| r.unsplit_recipes.len()).sum()
        }
        .max(1);

        // (runner name, assigned count, fractional remainder)
        let mut shares: Vec<(String, usize, f64)> = Vec::new();
        for (name, runner) in runners.iter() {
            let recipes = runner.unsplit_recipes.len();
            if recipes == 0 {
                continue;
            }
            let exact = recipes as f64 * number_of_iuts as f64 / total as f64;
            let base = (exact.floor() as usize).clamp(1, recipes);
            shares.push((name.clone(), base, exact - exact.floor()));
        }
        if shares.is_empty() {
            return Ok(iuts);
        }

        let assigned: usize = shares.iter().map(|s| s.1).sum();
        if assigned < number_of_iuts {
            self.distribute_remainder(runners, &mut shares, number_of_iuts - assigned);
        }

        let mut pool = iuts.into_iter();
        let mut taken: Vec<Resource> = Vec::new();
        let mut reuse_cursor = 0;
        for (name, count, _) in &shares {
            let runner = runners.get_mut(name).expect("runner disappeared");
            for _ in 0..*count {
                let iut = match pool.next() {
                    Some(iut) => {
                        taken.push(iut.clone());
                        iut
                    }
                    None => {
                        // More runner slots than IUTs: share an already
                        // assigned handle in sequence rather than starving
                        // this runner.
                        let shared = taken[reuse_cursor % taken.len()].clone();
                        reuse_cursor += 1;
                        shared
                    }
                };
                runner.slots.push(RunnerSlot::new(iut));
            }
            runner.number_of_iuts = runner.slots.len();
            debug!(
                "Assigned {} IUT(s) to test runner {:?}",
                runner.number_of_iuts, runner.name
            );
        }

        Ok(pool.collect())
    }

    /// Hand out spare IUTs by largest remainder, capped at each runner's
    /// recipe count. Leftovers that nobody can absorb stay unassigned.
    fn distribute_remainder(
        &self,
        runners: &BTreeMap<String, TestRunner>,
        shares: &mut [(String, usize, f64)],
        mut spare: usize,
    ) {
        let mut order: Vec<usize> = (0..shares.len()).collect();
        order.sort_by(|&a, &b| {
            shares[b]
                .2
                .partial_cmp(&shares[a].2)
                .unwrap_or(Ordering::Equal)
        });

        while spare > 0 {
            let mut gave = false;
            for &i in &order {
                if spare == 0 {
                    break;
                }
                let cap = runners[&shares[i].0].unsplit_recipes.len();
                if shares[i].1 < cap {
                    shares[i].1 += 1;
                    spare -= 1;
                    gave = true;
                }
            }
            if !gave {
                break;
            }
        }
    }

    /// Distribute a runner's recipes over its assigned IUT slots.
    ///
    /// Chunks are as even as possible and every slot ends up with at least
    /// one recipe, since a runner is never assigned more IUTs than it has
    /// recipes.
    pub fn split(&self, runner: &mut TestRunner) {
        let slots = runner.slots.len();
        if slots == 0 {
            return;
        }
        let recipes = std::mem::take(&mut runner.unsplit_recipes);
        let base = recipes.len() / slots;
        let remainder = recipes.len() % slots;

        let mut iter = recipes.into_iter();
        for (i, slot) in runner.slots.iter_mut().enumerate() {
            let take = base + usize::from(i < remainder);
            slot.recipes.extend(iter.by_ref().take(take));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ResourceKind;
    use crate::suite::{Constraint, Recipe};

    fn make_iut(id: &str) -> Resource {
        Resource {
            kind: ResourceKind::Iut,
            provider_id: "default".to_string(),
            identifier: id.to_string(),
            attributes: serde_json::Map::new(),
        }
    }

    fn make_recipe(id: usize) -> Recipe {
        Recipe {
            id: format!("recipe-{id}"),
            constraints: vec![Constraint {
                key: "TEST_RUNNER".to_string(),
                value: serde_json::Value::String("runner:latest".to_string()),
            }],
            test_case: None,
        }
    }

    fn make_runner(name: &str, recipes: usize) -> TestRunner {
        let mut runner = TestRunner::new(name, 1);
        runner.unsplit_recipes = (0..recipes).map(make_recipe).collect();
        runner
    }

    fn runner_map(runners: Vec<TestRunner>) -> BTreeMap<String, TestRunner> {
        runners
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect()
    }

    #[test]
    fn test_no_runner_with_recipes_gets_zero_iuts() {
        // One runner with a single recipe must not be starved by the
        // runner holding the bulk of the suite.
        let mut runners = runner_map(vec![make_runner("runner1", 1), make_runner("runner2", 4)]);
        let iuts = vec![make_iut("iut1"), make_iut("iut2")];

        let splitter = Splitter::new(5);
        let unused = splitter.assign_iuts(&mut runners, iuts).unwrap();

        assert!(unused.is_empty());
        for runner in runners.values() {
            assert!(
                runner.number_of_iuts >= 1,
                "runner {:?} got 0 assigned IUTs",
                runner.name
            );
        }
    }

    #[test]
    fn test_more_runners_than_iuts_shares_handles() {
        let mut runners = runner_map(vec![
            make_runner("a", 1),
            make_runner("b", 1),
            make_runner("c", 1),
        ]);
        let iuts = vec![make_iut("iut1"), make_iut("iut2")];

        let splitter = Splitter::new(3);
        let unused = splitter.assign_iuts(&mut runners, iuts).unwrap();

        assert!(unused.is_empty());
        for runner in runners.values() {
            assert_eq!(runner.number_of_iuts, 1);
        }
        // The third runner rides on a handle already assigned to another.
        let identifiers: Vec<_> = runners
            .values()
            .map(|r| r.slots[0].iut.identifier.clone())
            .collect();
        assert_eq!(identifiers.len(), 3);
        assert!(identifiers.iter().any(|id| id == "iut1"));
        assert!(identifiers.iter().any(|id| id == "iut2"));
    }

    #[test]
    fn test_proportional_distribution() {
        let mut runners = runner_map(vec![make_runner("small", 2), make_runner("large", 8)]);
        let iuts = (0..5).map(|i| make_iut(&format!("iut{i}"))).collect();

        let splitter = Splitter::new(10);
        let unused = splitter.assign_iuts(&mut runners, iuts).unwrap();

        assert!(unused.is_empty());
        assert_eq!(runners["small"].number_of_iuts, 1);
        assert_eq!(runners["large"].number_of_iuts, 4);
    }

    #[test]
    fn test_assignment_capped_at_recipe_count() {
        let mut runners = runner_map(vec![make_runner("only", 3)]);
        let iuts = (0..5).map(|i| make_iut(&format!("iut{i}"))).collect();

        let splitter = Splitter::new(3);
        let unused = splitter.assign_iuts(&mut runners, iuts).unwrap();

        assert_eq!(runners["only"].number_of_iuts, 3);
        assert_eq!(unused.len(), 2);
    }

    #[test]
    fn test_runner_without_recipes_is_not_scheduled() {
        let mut runners = runner_map(vec![make_runner("empty", 0), make_runner("busy", 4)]);
        let iuts = vec![make_iut("iut1"), make_iut("iut2")];

        let splitter = Splitter::new(4);
        splitter.assign_iuts(&mut runners, iuts).unwrap();

        assert_eq!(runners["empty"].number_of_iuts, 0);
        assert_eq!(runners["busy"].number_of_iuts, 2);
    }

    #[test]
    fn test_empty_iut_pool_is_fatal() {
        let mut runners = runner_map(vec![make_runner("a", 2)]);
        let splitter = Splitter::new(2);

        assert!(matches!(
            splitter.assign_iuts(&mut runners, Vec::new()),
            Err(SplitError::NoCapacity)
        ));
    }

    #[test]
    fn test_split_chunks_recipes_evenly() {
        let mut runners = runner_map(vec![make_runner("a", 5)]);
        let iuts = vec![make_iut("iut1"), make_iut("iut2")];

        let splitter = Splitter::new(5);
        splitter.assign_iuts(&mut runners, iuts).unwrap();

        let runner = runners.get_mut("a").unwrap();
        splitter.split(runner);

        assert!(runner.unsplit_recipes.is_empty());
        let sizes: Vec<_> = runner.slots.iter().map(|s| s.recipes.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        assert!(sizes.iter().all(|&s| s >= 1));
    }
}
