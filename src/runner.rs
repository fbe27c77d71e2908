use std::sync::Arc;

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    driver::{TaskResult, TurnDriver},
    env::Environment,
    error::EvalError,
    task::Task,
};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Fans a batch of tasks out over a bounded pool of concurrent runs.
/// Each run gets a fresh environment from the factory, so sibling
/// tasks never share mutable state. A failed task is logged and
/// dropped from the report instead of sinking the batch.
pub struct TaskRunner {
    driver: Arc<TurnDriver>,
    max_concurrency: usize,
    num_trials: usize,
    task_indices: Option<Vec<usize>>,
}

impl TaskRunner {
    pub fn new(driver: Arc<TurnDriver>) -> Self {
        Self {
            driver,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            num_trials: 1,
            task_indices: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_num_trials(mut self, num_trials: usize) -> Self {
        self.num_trials = num_trials.max(1);
        self
    }

    /// Restricts the batch to the given task indices. Defaults to
    /// every task in the file.
    pub fn with_task_indices(mut self, indices: Vec<usize>) -> Self {
        self.task_indices = Some(indices);
        self
    }

    pub async fn run<F>(&self, tasks: Vec<Task>, make_env: F) -> Result<RunReport, EvalError>
    where
        F: Fn(usize) -> Box<dyn Environment> + Send + Sync + 'static,
    {
        if let Some(store) = self.driver.store() {
            store.clear_all().await?;
        }

        let indices: Vec<usize> = self
            .task_indices
            .clone()
            .unwrap_or_else(|| (0..tasks.len()).collect());
        let total = indices.len() * self.num_trials;

        let tasks = Arc::new(tasks);
        let make_env = Arc::new(make_env);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();

        for trial in 0..self.num_trials {
            for &task_index in &indices {
                let driver = Arc::clone(&self.driver);
                let tasks = Arc::clone(&tasks);
                let make_env = Arc::clone(&make_env);
                let semaphore = Arc::clone(&semaphore);

                join_set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    };

                    let Some(task) = tasks.get(task_index) else {
                        warn!(task_index, "task index out of range, skipping");
                        return None;
                    };

                    info!(task_id = %task.id, task_index, trial, "starting task");
                    let mut env = make_env(task_index);
                    match driver.solve(env.as_mut(), task, task_index).await {
                        Ok(result) => Some(TaskOutcome {
                            task_id: task.id.clone(),
                            task_index,
                            trial,
                            result,
                        }),
                        Err(error) => {
                            error!(task_id = %task.id, task_index, trial, %error, "task failed");
                            None
                        }
                    }
                });
            }
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(outcome)) => results.push(outcome),
                Ok(None) => {}
                Err(error) => error!(%error, "task worker panicked"),
            }
        }
        results.sort_by_key(|outcome| (outcome.trial, outcome.task_index));

        Ok(RunReport::from_results(total, results))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub task_index: usize,
    pub trial: usize,
    pub result: TaskResult,
}

/// Batch totals over the completed runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub total_reward: f64,
    pub total_cost: f64,
    pub total_user_cost: f64,
    pub results: Vec<TaskOutcome>,
}

impl RunReport {
    fn from_results(total: usize, results: Vec<TaskOutcome>) -> Self {
        let completed = results.len();
        let successful = results
            .iter()
            .filter(|outcome| outcome.result.is_successful())
            .count();
        let total_reward = results.iter().map(|o| o.result.reward).sum();
        let total_cost = results.iter().map(|o| o.result.agent_usage.cost).sum();
        let total_user_cost = results.iter().map(|o| o.result.user_usage.cost).sum();

        Self {
            total,
            completed,
            successful,
            total_reward,
            total_cost,
            total_user_cost,
            results,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.successful as f64 / self.completed as f64
    }
}
