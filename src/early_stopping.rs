use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Improved,
    NoImprovement { epochs_without_improvement: usize },
    Stop,
}

/// Stops once validation accuracy has not strictly improved for `patience` epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub patience: usize,
    pub best_accuracy: f64,
    pub best_epoch: usize,
    pub epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_accuracy: 0.0,
            best_epoch: 0,
            epochs_without_improvement: 0,
        }
    }

    pub fn update(&mut self, epoch: usize, accuracy: f64) -> Verdict {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            self.best_epoch = epoch;
            self.epochs_without_improvement = 0;
            return Verdict::Improved;
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            Verdict::Stop
        } else {
            Verdict::NoImprovement {
                epochs_without_improvement: self.epochs_without_improvement,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_flat_epochs() {
        let mut stopper = EarlyStopping::new(2);
        assert_eq!(stopper.update(0, 40.0), Verdict::Improved);
        assert_eq!(stopper.update(1, 55.0), Verdict::Improved);
        assert_eq!(
            stopper.update(2, 55.0),
            Verdict::NoImprovement {
                epochs_without_improvement: 1
            }
        );
        assert_eq!(stopper.update(3, 50.0), Verdict::Stop);
        assert_eq!(stopper.best_epoch, 1);
        assert_eq!(stopper.best_accuracy, 55.0);
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut stopper = EarlyStopping::new(3);
        stopper.update(0, 10.0);
        stopper.update(1, 5.0);
        stopper.update(2, 5.0);
        assert_eq!(stopper.update(3, 11.0), Verdict::Improved);
        assert_eq!(stopper.epochs_without_improvement, 0);
    }

    #[test]
    fn zero_accuracy_never_counts_as_improvement() {
        let mut stopper = EarlyStopping::new(1);
        assert_eq!(stopper.update(0, 0.0), Verdict::Stop);
    }
}
