//! seeded synthetic cohorts for demos, tests and benches
//!
//! `generate` follows the dashboard's test-data recipe: mostly uniform
//! questionnaire scores, with burnout driven by stress and overtime, job
//! satisfaction falling with burnout, and a distress score that shortens
//! time to crisis and raises the chance of a crisis event.

use std::sync::Arc;

use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::cohort::{Cohort, Schema, SubjectId, SubjectRecord, fields};

const HEALTHCARE_ROLES: [&str; 9] = [
    "Doctor",
    "Nurse",
    "Admin Staff",
    "Paramedic",
    "Technician",
    "Therapist",
    "Pharmacist",
    "Midwife",
    "Healthcare Assistant",
];

const DEPARTMENTS: [&str; 13] = [
    "Emergency",
    "Surgery",
    "Pediatrics",
    "Oncology",
    "Cardiology",
    "Neurology",
    "Psychiatry",
    "Radiology",
    "General Practice",
    "Intensive Care",
    "Obstetrics",
    "Geriatrics",
    "Administration",
];

const EMPLOYMENT: [&str; 4] = ["Full-time", "Part-time", "Contract", "Temporary"];
const INCOME: [&str; 3] = ["Low", "Medium", "High"];
const MH_DISORDERS: [&str; 7] = ["None", "Depression", "Anxiety", "Bipolar", "PTSD", "Depression, Anxiety", "Multiple"];
const SUBSTANCE: [&str; 5] = ["None", "Alcohol", "Cannabis", "Prescription Drugs", "Multiple"];
const CHRONIC: [&str; 5] = ["None", "Diabetes", "Hypertension", "Asthma", "Multiple"];

/// observation dates fall in the year starting here
const OBSERVATION_START: (i32, u32, u32) = (2024, 1, 1);

fn pick<'a>(rng: &mut StdRng, options: &[&'a str]) -> &'a str {
    options[rng.gen_range(0..options.len())]
}

/// index drawn with the given (unnormalised) weights
fn pick_weighted(rng: &mut StdRng, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return i;
        }
        u -= w;
    }
    weights.len() - 1
}

fn score(rng: &mut StdRng) -> i64 {
    rng.gen_range(0..=10)
}

fn normal(rng: &mut StdRng, sd: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    z * sd
}

/// clip to [lo, hi] and truncate, as the recipe stores integers
fn clipped(x: f64, lo: f64, hi: f64) -> i64 {
    x.clamp(lo, hi) as i64
}

/// `n` subjects over the full crisis schema, reproducible from `seed`
pub fn generate(n: usize, seed: u64) -> Cohort {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = NaiveDate::from_ymd_opt(OBSERVATION_START.0, OBSERVATION_START.1, OBSERVATION_START.2);
    let yes_no = |rng: &mut StdRng, p_yes: f64| if rng.gen_bool(p_yes) { "Yes" } else { "No" };

    let records = (0..n as u64)
        .map(|id| {
            let stress = score(&mut rng);
            let overtime = rng.gen_range(0..=40_i64);
            let hopelessness = score(&mut rng);
            let despair = score(&mut rng);
            let isolation = score(&mut rng);
            let lethal_means = score(&mut rng);
            let relationships = score(&mut rng);

            let burnout = clipped(0.4 * stress as f64 + 0.1 * overtime as f64 + normal(&mut rng, 1.0), 0.0, 10.0);
            let satisfaction = clipped(10.0 - 0.7 * burnout as f64 + normal(&mut rng, 1.0), 0.0, 10.0);
            let distress = clipped(
                0.2 * hopelessness as f64
                    + 0.2 * despair as f64
                    + 0.15 * isolation as f64
                    + 0.15 * burnout as f64
                    + 0.1 * stress as f64
                    + 0.1 * lethal_means as f64
                    - 0.1 * relationships as f64
                    - 0.1 * satisfaction as f64
                    + normal(&mut rng, 1.0),
                0.0,
                10.0,
            );
            let time_to_crisis = clipped(
                365.0 * (1.0 - distress as f64 / 15.0) + normal(&mut rng, 30.0),
                7.0,
                365.0,
            );
            let crisis = rng.gen_bool(distress as f64 / 15.0);

            let sex = ["Male", "Female", "Other"][pick_weighted(&mut rng, &[0.45, 0.50, 0.05])];
            let attempts = pick_weighted(&mut rng, &[0.85, 0.10, 0.03, 0.02]) as i64;

            let record = SubjectRecord::new(SubjectId(id))
                .with(fields::AGE, rng.gen_range(22..=70_i64))
                .with(fields::SEX, sex)
                .with(fields::EMPLOYMENT_STATUS, pick(&mut rng, &EMPLOYMENT))
                .with("Income_Level", pick(&mut rng, &INCOME))
                .with("Social_Deprivation", score(&mut rng))
                .with("Material_Deprivation", score(&mut rng))
                .with(fields::HEALTHCARE_ROLE, pick(&mut rng, &HEALTHCARE_ROLES))
                .with("Department", pick(&mut rng, &DEPARTMENTS))
                .with("Years_Experience", rng.gen_range(0..=40_i64))
                .with("Weekly_Hours", rng.gen_range(20..=60_i64))
                .with("Night_Shifts_Monthly", rng.gen_range(0..=12_i64))
                .with("Overtime_Hours_Monthly", overtime)
                .with("Patient_Facing", yes_no(&mut rng, 0.5))
                .with("Management_Responsibilities", yes_no(&mut rng, 0.5))
                .with(fields::WORK_STRESS_LEVEL, stress)
                .with("Job_Satisfaction", satisfaction)
                .with("Workplace_Support", score(&mut rng))
                .with(fields::BURNOUT_LEVEL, burnout)
                .with("Sick_Days_Last_Year", rng.gen_range(0..=30_i64))
                .with("Workplace_Incidents", rng.gen_range(0..=5_i64))
                .with("Recent_Promotion", yes_no(&mut rng, 0.2))
                .with("Recent_Demotion", yes_no(&mut rng, 0.05))
                .with("MH_Disorders", pick(&mut rng, &MH_DISORDERS))
                .with("Substance_Use_Disorders", pick(&mut rng, &SUBSTANCE))
                .with("History_Suicidal_Ideation", rng.gen_bool(0.2))
                .with("Previous_Suicide_Attempts", attempts)
                .with("Frequency_Suicidal_Thoughts", score(&mut rng))
                .with("Intensity_Suicidal_Thoughts", score(&mut rng))
                .with("Chronic_Illnesses", pick(&mut rng, &CHRONIC))
                .with("GP_Visits", rng.gen_range(0..=20_i64))
                .with("ED_Visits", rng.gen_range(0..=10_i64))
                .with("Hospitalizations", rng.gen_range(0..=5_i64))
                .with(fields::HOPELESSNESS, hopelessness)
                .with(fields::DESPAIR, despair)
                .with("Impulsivity", score(&mut rng))
                .with("Aggression", score(&mut rng))
                .with("Access_Lethal_Means", lethal_means)
                .with(fields::SOCIAL_ISOLATION, isolation)
                .with("Coping_Strategies", score(&mut rng))
                .with("Measured_Resilience", score(&mut rng))
                .with("MH_Service_Engagement", score(&mut rng))
                .with("Supportive_Relationships", relationships)
                .with(fields::SUICIDAL_DISTRESS, distress)
                .with(fields::TIME_TO_CRISIS, time_to_crisis)
                .with(fields::CRISIS_EVENT, crisis);

            match start.and_then(|d| d.checked_add_days(Days::new(rng.gen_range(0..365)))) {
                Some(date) => record.with(fields::OBSERVATION_DATE, date),
                None => record,
            }
        })
        .collect();

    Cohort::from_parts(Arc::new(Schema::crisis()), records)
}

/// two equal groups with exponential times to crisis, the exposed group
/// (`History_Suicidal_Ideation`) at `hazard_ratio` times the baseline rate.
///
/// uniforms are stratified per group so the sample tracks the exponential
/// closely even for a few hundred subjects. follow-up ends at 365 days.
pub fn proportional_hazards(n: usize, hazard_ratio: f64, seed: u64) -> Cohort {
    const BASELINE_RATE: f64 = 1.0 / 180.0;
    const FOLLOW_UP: f64 = 365.0;

    let mut rng = StdRng::seed_from_u64(seed);
    let half = n / 2;
    let mut records = Vec::with_capacity(n);

    for (group, size) in [(false, n - half), (true, half)] {
        let rate = if group { BASELINE_RATE * hazard_ratio } else { BASELINE_RATE };
        for k in 0..size {
            let u = (k as f64 + rng.gen_range(0.0..1.0)) / size as f64;
            // -ln(u) > 0, so the first day is 1
            let t = (-(u.max(f64::MIN_POSITIVE)).ln() / rate).ceil();
            let (time, event) = if t > FOLLOW_UP { (FOLLOW_UP, false) } else { (t, true) };
            records.push(
                SubjectRecord::new(SubjectId(records.len() as u64))
                    .with(fields::AGE, rng.gen_range(22..=70_i64))
                    .with("History_Suicidal_Ideation", group)
                    .with(fields::TIME_TO_CRISIS, time as i64)
                    .with(fields::CRISIS_EVENT, event),
            );
        }
    }

    Cohort::from_parts(Arc::new(Schema::crisis()), records)
}
