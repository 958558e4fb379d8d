// ========================================================================================
//                        Binary classification scoring
// ========================================================================================
//
// ROC curve, area under it, the Youden-optimal operating threshold and the 2×2
// confusion matrix. These are consumed by the predictors (to pick a threshold on
// the training set) and by the validator (to score held-out data).

use ndarray::ArrayView1;

/// Receiver operating characteristic over the distinct score thresholds.
///
/// Thresholds are decreasing. The first point is `(0, 0)` with threshold `+∞`, so
/// that the curve always starts at the origin; a sample is called positive at
/// threshold `t` when its score is `>= t`.
#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    /// Builds the curve from 0/1 labels and scores. Points lying on a straight
    /// segment between their neighbours are dropped.
    pub fn new(labels: ArrayView1<f64>, scores: ArrayView1<f64>) -> Self {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let mut tps = Vec::new();
        let mut fps = Vec::new();
        let mut thresholds = Vec::new();
        let (mut tp, mut fp) = (0.0, 0.0);
        for (pos, &i) in order.iter().enumerate() {
            if labels[i] > 0.5 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            let last_of_run = order
                .get(pos + 1)
                .is_none_or(|&next| scores[next] != scores[i]);
            if last_of_run {
                tps.push(tp);
                fps.push(fp);
                thresholds.push(scores[i]);
            }
        }

        let keep = corner_points(&fps, &tps);
        let mut curve = RocCurve {
            fpr: vec![0.0],
            tpr: vec![0.0],
            thresholds: vec![f64::INFINITY],
        };
        let positives = tp;
        let negatives = fp;
        for idx in keep {
            curve.fpr.push(ratio(fps[idx], negatives));
            curve.tpr.push(ratio(tps[idx], positives));
            curve.thresholds.push(thresholds[idx]);
        }
        curve
    }

    /// Trapezoidal area under the curve.
    pub fn auc(&self) -> f64 {
        self.fpr
            .windows(2)
            .zip(self.tpr.windows(2))
            .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
            .sum()
    }

    /// Threshold maximizing `tpr − fpr` (Youden's J). The first maximum wins.
    pub fn youden_threshold(&self) -> f64 {
        let mut best = 0;
        for i in 1..self.thresholds.len() {
            if self.tpr[i] - self.fpr[i] > self.tpr[best] - self.fpr[best] {
                best = i;
            }
        }
        self.thresholds[best]
    }
}

// Indices to keep: both ends, plus every point where the curve changes direction.
fn corner_points(fps: &[f64], tps: &[f64]) -> Vec<usize> {
    let n = fps.len();
    (0..n)
        .filter(|&i| {
            if i == 0 || i + 1 == n {
                return true;
            }
            let second_diff = |v: &[f64]| v[i + 1] - 2.0 * v[i] + v[i - 1];
            second_diff(fps) != 0.0 || second_diff(tps) != 0.0
        })
        .collect()
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Convenience: the training AUC and Youden threshold in one pass.
pub fn auc_and_threshold(labels: ArrayView1<f64>, scores: ArrayView1<f64>) -> (f64, f64) {
    let roc = RocCurve::new(labels, scores);
    (roc.auc(), roc.youden_threshold())
}

/// Counts of a binary classification outcome. Every derived rate returns 0.0 when
/// its denominator is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
    pub tp: usize,
}

impl ConfusionMatrix {
    pub fn new(labels: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Self {
        let mut m = ConfusionMatrix::default();
        for (&y, &y_hat) in labels.iter().zip(predicted.iter()) {
            match (y > 0.5, y_hat > 0.5) {
                (false, false) => m.tn += 1,
                (false, true) => m.fp += 1,
                (true, false) => m.fn_ += 1,
                (true, true) => m.tp += 1,
            }
        }
        m
    }

    fn rate(num: usize, den: usize) -> f64 {
        ratio(num as f64, den as f64)
    }

    pub fn total(&self) -> usize {
        self.tn + self.fp + self.fn_ + self.tp
    }

    pub fn accuracy(&self) -> f64 {
        Self::rate(self.tp + self.tn, self.total())
    }

    pub fn misclassification(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            1.0 - self.accuracy()
        }
    }

    pub fn precision(&self) -> f64 {
        Self::rate(self.tp, self.tp + self.fp)
    }

    /// Also the sensitivity.
    pub fn recall(&self) -> f64 {
        Self::rate(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> f64 {
        Self::rate(self.tn, self.tn + self.fp)
    }

    pub fn fall_out(&self) -> f64 {
        Self::rate(self.fp, self.fp + self.tn)
    }

    pub fn miss_rate(&self) -> f64 {
        Self::rate(self.fn_, self.fn_ + self.tp)
    }

    pub fn f1_score(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        ratio(2.0 * p * r, p + r)
    }
}
