//! Grade computation for corrections.
//!
//! Pure functions over an activity's per-part maximum points and a correction's
//! earned points, penalty, bonus and disabled-parts mask. No I/O, no errors:
//! every degenerate input produces a defined numeric output.

/// Lifecycle status of a correction. Gates which grade branch applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeStatus {
    Active,
    Deactivated,
    Absent,
    NonRendu,
    NonNote,
}

impl GradeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "DEACTIVATED" => Some(Self::Deactivated),
            "ABSENT" => Some(Self::Absent),
            "NON_RENDU" => Some(Self::NonRendu),
            "NON_NOTE" => Some(Self::NonNote),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Deactivated => "DEACTIVATED",
            Self::Absent => "ABSENT",
            Self::NonRendu => "NON_RENDU",
            Self::NonNote => "NON_NOTE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeResult {
    pub grade: f64,
    pub final_grade: f64,
}

/// Grade at or above which the penalty floor kicks in; penalties never push a
/// grade that reached this threshold back below it.
const PENALTY_FLOOR: f64 = 5.0;

/// Fraction of the enabled maximum awarded for a NON_RENDU correction.
const NON_RENDU_RATIO: f64 = 0.25;

fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn part_enabled(disabled: Option<&[bool]>, i: usize) -> bool {
    !disabled.and_then(|d| d.get(i).copied()).unwrap_or(false)
}

/// Sum of `max_points` over enabled indices.
pub fn enabled_max_total(max_points: &[f64], disabled: Option<&[bool]>) -> f64 {
    max_points
        .iter()
        .enumerate()
        .filter(|(i, _)| part_enabled(disabled, *i))
        .map(|(_, v)| sanitize(*v))
        .sum()
}

fn clamp_non_negative(v: f64) -> f64 {
    if v < 0.0 {
        0.0
    } else {
        v
    }
}

/// Raw and final grade for an ACTIVE correction.
///
/// Disabled indices contribute to neither the earned sum nor the maximum.
/// Earned entries missing beyond the end of the array count as 0. The bonus is
/// added at the raw-total step; the penalty applies only once the raw grade
/// reached the floor, and never pushes it back below the floor. Grades below
/// the floor pass through untouched so failing grades are preserved as-is.
pub fn calculate_grade(
    max_points: &[f64],
    earned_points: &[f64],
    penalty: f64,
    bonus: Option<f64>,
    disabled_parts: Option<&[bool]>,
) -> GradeResult {
    let mut raw_total = 0.0;
    for i in 0..max_points.len() {
        if !part_enabled(disabled_parts, i) {
            continue;
        }
        raw_total += sanitize(earned_points.get(i).copied().unwrap_or(0.0));
    }

    let grade = raw_total + sanitize(bonus.unwrap_or(0.0));
    let penalty = sanitize(penalty);

    let final_grade = if grade < PENALTY_FLOOR {
        grade
    } else {
        (grade - penalty).max(PENALTY_FLOOR)
    };

    GradeResult {
        grade: clamp_non_negative(grade),
        final_grade: clamp_non_negative(final_grade),
    }
}

/// Fixed grade for a NON_RENDU correction: 25% of the enabled maximum,
/// independent of any earned points.
pub fn non_rendu_grade(max_points: &[f64], disabled_parts: Option<&[bool]>) -> GradeResult {
    let g = clamp_non_negative(NON_RENDU_RATIO * enabled_max_total(max_points, disabled_parts));
    GradeResult {
        grade: g,
        final_grade: g,
    }
}

/// Final grade normalized to a 0-20 scale over the enabled denominator.
/// A denominator <= 0 returns the grade unchanged rather than dividing.
pub fn percentage_grade(
    final_grade: f64,
    max_points: &[f64],
    disabled_parts: Option<&[bool]>,
) -> f64 {
    let denom = enabled_max_total(max_points, disabled_parts);
    let final_grade = sanitize(final_grade);
    if denom <= 0.0 {
        final_grade
    } else {
        (final_grade / denom) * 20.0
    }
}

/// Resize `earned` to `target_len`: pad with zeros at the end if too short,
/// truncate from the end if too long. Invoked whenever an activity's part
/// layout changes under existing corrections.
pub fn reconcile_points_earned(earned: &[f64], target_len: usize) -> Vec<f64> {
    let mut out: Vec<f64> = earned.iter().map(|v| sanitize(*v)).collect();
    out.resize(target_len, 0.0);
    out
}

/// Status policy: which branch applies for a correction in `status`.
///
/// `Active` computes normally; a NULL `earned_points` under `Active` counts as
/// all zeros. `NonRendu` always uses the fixed rule, ignoring earned points.
/// The remaining statuses clear the derived fields (`None`).
pub fn grade_for_status(
    status: GradeStatus,
    max_points: &[f64],
    earned_points: Option<&[f64]>,
    penalty: f64,
    bonus: Option<f64>,
    disabled_parts: Option<&[bool]>,
) -> Option<GradeResult> {
    match status {
        GradeStatus::Active => Some(calculate_grade(
            max_points,
            earned_points.unwrap_or(&[]),
            penalty,
            bonus,
            disabled_parts,
        )),
        GradeStatus::NonRendu => Some(non_rendu_grade(max_points, disabled_parts)),
        GradeStatus::Deactivated | GradeStatus::Absent | GradeStatus::NonNote => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_sum_with_no_adjustments() {
        let r = calculate_grade(&[10.0, 10.0], &[8.0, 9.0], 0.0, None, None);
        assert_eq!(r.grade, 17.0);
        assert_eq!(r.final_grade, 17.0);
    }

    #[test]
    fn penalty_applies_with_floor() {
        // grade 17, penalty 2 -> final max(5, 15) = 15.
        let r = calculate_grade(&[10.0, 10.0], &[8.0, 9.0], 2.0, None, None);
        assert_eq!(r.grade, 17.0);
        assert_eq!(r.final_grade, 15.0);
    }

    #[test]
    fn penalty_never_drops_below_floor() {
        let r = calculate_grade(&[10.0, 10.0], &[4.0, 3.0], 20.0, None, None);
        assert_eq!(r.grade, 7.0);
        assert_eq!(r.final_grade, 5.0);
    }

    #[test]
    fn low_grades_bypass_penalty() {
        // grade 3 (< 5) keeps its value regardless of penalty.
        let r = calculate_grade(&[10.0, 10.0], &[1.0, 2.0], 5.0, None, None);
        assert_eq!(r.grade, 3.0);
        assert_eq!(r.final_grade, 3.0);
    }

    #[test]
    fn bonus_added_at_raw_total() {
        let r = calculate_grade(&[10.0, 10.0], &[2.0, 2.0], 0.0, Some(1.5), None);
        assert_eq!(r.grade, 5.5);
        assert_eq!(r.final_grade, 5.5);

        // Bonus can lift a grade over the floor threshold before the penalty check.
        let r = calculate_grade(&[10.0, 10.0], &[2.0, 2.0], 10.0, Some(1.5), None);
        assert_eq!(r.final_grade, 5.0);
    }

    #[test]
    fn disabled_part_excluded_from_both_sums() {
        // Middle part disabled -> enabled max 20, enabled earned 10.
        let r = calculate_grade(
            &[10.0, 10.0, 10.0],
            &[5.0, 5.0, 5.0],
            0.0,
            None,
            Some(&[false, true, false]),
        );
        assert_eq!(r.grade, 10.0);
        assert_eq!(r.final_grade, 10.0);
        assert_eq!(
            enabled_max_total(&[10.0, 10.0, 10.0], Some(&[false, true, false])),
            20.0
        );
    }

    #[test]
    fn disabling_equals_removing_the_part() {
        let with_mask = calculate_grade(
            &[10.0, 8.0, 12.0],
            &[7.0, 3.0, 11.0],
            0.0,
            None,
            Some(&[false, true, false]),
        );
        let without_part = calculate_grade(&[10.0, 12.0], &[7.0, 11.0], 0.0, None, None);
        assert_eq!(with_mask, without_part);
    }

    #[test]
    fn short_earned_array_counts_missing_as_zero() {
        let r = calculate_grade(&[10.0, 10.0, 10.0], &[6.0], 0.0, None, None);
        assert_eq!(r.grade, 6.0);
    }

    #[test]
    fn nan_inputs_coerced_to_zero() {
        let r = calculate_grade(&[10.0, 10.0], &[f64::NAN, 4.0], f64::NAN, None, None);
        assert_eq!(r.grade, 4.0);
        assert_eq!(r.final_grade, 4.0);
    }

    #[test]
    fn final_grade_never_negative() {
        let r = calculate_grade(&[10.0], &[-3.0], 0.0, None, None);
        assert_eq!(r.grade, 0.0);
        assert_eq!(r.final_grade, 0.0);
    }

    #[test]
    fn non_rendu_is_quarter_of_enabled_max() {
        // max [10, 10] -> 25% of 20 = 5.
        let r = non_rendu_grade(&[10.0, 10.0], None);
        assert_eq!(r.grade, 5.0);
        assert_eq!(r.final_grade, 5.0);

        let r = non_rendu_grade(&[10.0, 10.0], Some(&[true, false]));
        assert_eq!(r.grade, 2.5);
    }

    #[test]
    fn status_policy_branches() {
        let max = [10.0, 10.0];
        let earned = [8.0, 9.0];

        let active = grade_for_status(GradeStatus::Active, &max, Some(&earned), 0.0, None, None);
        assert_eq!(active.map(|r| r.grade), Some(17.0));

        // NON_RENDU ignores earned points entirely, even when present.
        let nr = grade_for_status(GradeStatus::NonRendu, &max, Some(&earned), 0.0, None, None);
        assert_eq!(nr.map(|r| r.grade), Some(5.0));
        let nr_null = grade_for_status(GradeStatus::NonRendu, &max, None, 0.0, None, None);
        assert_eq!(nr_null.map(|r| r.grade), Some(5.0));

        // NULL earned points under ACTIVE counts as all zeros.
        let active_null = grade_for_status(GradeStatus::Active, &max, None, 0.0, None, None);
        assert_eq!(active_null.map(|r| r.grade), Some(0.0));

        assert!(
            grade_for_status(GradeStatus::Absent, &max, Some(&earned), 0.0, None, None).is_none()
        );
        assert!(grade_for_status(GradeStatus::Deactivated, &max, None, 0.0, None, None).is_none());
        assert!(grade_for_status(GradeStatus::NonNote, &max, None, 0.0, None, None).is_none());
    }

    #[test]
    fn percentage_normalizes_to_twenty() {
        assert_eq!(percentage_grade(15.0, &[10.0, 20.0], None), 10.0);
        assert_eq!(
            percentage_grade(10.0, &[10.0, 10.0, 10.0], Some(&[false, true, false])),
            10.0
        );
    }

    #[test]
    fn percentage_guards_zero_denominator() {
        assert_eq!(percentage_grade(7.0, &[], None), 7.0);
        assert_eq!(percentage_grade(7.0, &[10.0], Some(&[true])), 7.0);
    }

    #[test]
    fn reconcile_pads_and_truncates() {
        assert_eq!(
            reconcile_points_earned(&[1.0, 2.0], 4),
            vec![1.0, 2.0, 0.0, 0.0]
        );
        assert_eq!(reconcile_points_earned(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(reconcile_points_earned(&[], 0), Vec::<f64>::new());
    }

    #[test]
    fn reconcile_is_idempotent() {
        for (input, n) in [
            (vec![1.0, 2.0, 3.0], 5usize),
            (vec![1.0, 2.0, 3.0], 2),
            (vec![], 3),
        ] {
            let once = reconcile_points_earned(&input, n);
            let twice = reconcile_points_earned(&once, n);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            GradeStatus::Active,
            GradeStatus::Deactivated,
            GradeStatus::Absent,
            GradeStatus::NonRendu,
            GradeStatus::NonNote,
        ] {
            assert_eq!(GradeStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(GradeStatus::parse("RENDU"), None);
    }
}
