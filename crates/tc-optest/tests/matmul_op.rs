use std::fs;

use serde_json::Value;
use tc_device::{Arch, Capability, Target};
use tc_jit::CompileOptions;
use tc_optest::{
    CaseSpec, CaseState, GateDecision, GradCheck, HarnessConfig, InputSpec, MatmulSuite, SuiteFixture,
    SuiteReport, ToleranceSpec, Verdict, load_matmul_suite, run_matmul_suite,
};

const FULL_TRAIL: [CaseState; 6] = [
    CaseState::Init,
    CaseState::BuiltReference,
    CaseState::BuiltCompiled,
    CaseState::ExecutedBoth,
    CaseState::Compared,
    CaseState::Pass,
];

fn seeded_config(seed: u64) -> HarnessConfig {
    HarnessConfig {
        seed: Some(seed),
        ..HarnessConfig::default_paths()
    }
}

fn bundled_suite(seed: u64) -> MatmulSuite {
    load_matmul_suite(&seeded_config(seed))
        .expect("bundled fixture")
        .with_probe(|| true)
}

fn single_case_fixture(name: &str, a: &[usize], b: &[usize], expected: Option<&[usize]>) -> SuiteFixture {
    fixture_on(Arch::X86, name, a, b, expected)
}

fn fixture_on(
    arch: Arch,
    name: &str,
    a: &[usize],
    b: &[usize],
    expected: Option<&[usize]>,
) -> SuiteFixture {
    SuiteFixture {
        suite: "matmul_adhoc".to_owned(),
        required_capability: None,
        skip_reason: String::new(),
        target: arch,
        tolerance: ToleranceSpec::default(),
        cases: vec![CaseSpec {
            name: name.to_owned(),
            inputs: vec![
                InputSpec {
                    name: "A".to_owned(),
                    shape: a.to_vec(),
                },
                InputSpec {
                    name: "B".to_owned(),
                    shape: b.to_vec(),
                },
            ],
            expected_output_shape: expected.map(<[usize]>::to_vec),
        }],
    }
}

fn diffs(report: &SuiteReport) -> Vec<f64> {
    report
        .cases
        .iter()
        .flat_map(|case| case.comparisons.iter().map(|comparison| comparison.max_abs_diff))
        .collect()
}

#[test]
fn every_bundled_case_passes_on_host() {
    let report = bundled_suite(11).with_target(Target::host()).run();
    assert!(report.is_green(), "{report:#?}");
    assert_eq!(report.total, 6);
    assert_eq!(report.passed, 6);
    for case in &report.cases {
        assert_eq!(case.state_trail, FULL_TRAIL, "case {}", case.case);
        assert_eq!(case.grad_check, Some(GradCheck::Compared));
        // one output plus one gradient per input
        assert_eq!(case.comparisons.len(), 3);
        assert!(case.diagnostic.is_none());
    }
}

#[cfg(feature = "nvgpu")]
#[test]
fn every_bundled_case_passes_on_nvgpu() {
    let suite = bundled_suite(12);
    assert_eq!(suite.target(), Target::nvgpu());
    let report = suite.run();
    assert!(report.is_green(), "{report:#?}");
    assert_eq!(report.passed, report.total);
}

#[test]
fn output_shapes_follow_broadcasting_rules() {
    let report = bundled_suite(3).with_target(Target::host()).run();
    let shape = |name: &str| {
        report
            .case(name)
            .and_then(|case| case.output_shape.clone())
            .expect("case ran")
    };
    assert_eq!(shape("matmul_2d"), vec![4, 32]);
    assert_eq!(shape("matmul_vec_vec"), Vec::<usize>::new());
    assert_eq!(shape("matmul_batched"), vec![5, 4, 32]);
    assert_eq!(shape("matmul_vec_mat"), vec![4]);
    assert_eq!(shape("matmul_mat_vec"), vec![4]);
    assert_eq!(shape("matmul_broadcast_batch"), vec![3, 2, 4, 8]);
    assert_eq!(
        report.case("matmul_2d").map(|case| case.input_shapes.as_str()),
        Some("A[4, 16] B[16, 32]")
    );
}

#[test]
fn missing_capability_skips_every_case_from_init() {
    let report = load_matmul_suite(&HarnessConfig::default_paths())
        .expect("bundled fixture")
        .with_probe(|| false)
        .run();
    assert!(report.gate.is_skip());
    assert_eq!(report.skipped, report.total);
    assert!(report.is_green());
    for case in &report.cases {
        assert_eq!(case.verdict, Verdict::Skip);
        assert_eq!(case.state_trail, vec![CaseState::Init, CaseState::Skip]);
        assert!(case.comparisons.is_empty());
        assert_eq!(
            case.diagnostic.as_deref(),
            Some("x86 test will be skipped due to timeout.")
        );
        assert_eq!(case.forensic_log.reason_code, "capability_missing");
    }
}

#[test]
fn seeded_runs_reproduce_identical_differences() {
    let first = bundled_suite(99).with_target(Target::host()).run();
    let second = bundled_suite(99).with_target(Target::host()).run();
    assert_eq!(diffs(&first), diffs(&second));
    for (lhs, rhs) in first.cases.iter().zip(&second.cases) {
        assert_eq!(lhs.forensic_log.seed, Some(99));
        assert_eq!(lhs.forensic_log.replay_command, rhs.forensic_log.replay_command);
    }
}

#[test]
fn gradientless_executable_is_exempt_not_failed() {
    let report = bundled_suite(5)
        .with_target(Target::host())
        .with_compile_options(CompileOptions { gradients: false })
        .run();
    assert!(report.is_green(), "{report:#?}");
    for case in &report.cases {
        assert!(matches!(case.grad_check, Some(GradCheck::Exempt { .. })));
        assert_eq!(case.comparisons.len(), 1);
    }
}

#[test]
fn gradient_checking_can_be_switched_off() {
    let tolerance = ToleranceSpec {
        check_grads: false,
        ..ToleranceSpec::default()
    };
    let report = bundled_suite(6)
        .with_target(Target::host())
        .with_tolerance(tolerance)
        .run();
    assert!(report.is_green());
    for case in &report.cases {
        assert_eq!(case.grad_check, Some(GradCheck::NotRequested));
        assert_eq!(case.comparisons.len(), 1);
    }
}

#[test]
fn declared_output_shape_mismatch_fails_after_comparison() {
    let fixture = single_case_fixture("wrong_shape", &[4, 16], &[16, 32], Some(&[4, 16]));
    let report = MatmulSuite::new(fixture, &seeded_config(1)).run();
    let case = &report.cases[0];
    assert_eq!(case.verdict, Verdict::Fail);
    assert_eq!(case.state_trail.last(), Some(&CaseState::Fail));
    assert!(case.state_trail.contains(&CaseState::ExecutedBoth));
    assert_eq!(case.forensic_log.reason_code, "output_shape_mismatch");
    assert!(!report.is_green());
}

#[test]
fn incompatible_inner_dimensions_fail_with_input_shapes() {
    let fixture = single_case_fixture("bad_inner", &[4, 16], &[8, 32], None);
    let report = MatmulSuite::new(fixture, &seeded_config(2)).run();
    let case = &report.cases[0];
    assert_eq!(case.verdict, Verdict::Fail);
    assert_eq!(case.state_trail, vec![CaseState::Init, CaseState::Fail]);
    let diagnostic = case.diagnostic.as_deref().expect("diagnostic");
    assert!(diagnostic.contains("A[4, 16] B[8, 32]"), "{diagnostic}");
    assert_eq!(report.failed, 1);
}

#[test]
fn open_gate_runs_suites_without_a_capability() {
    let fixture = single_case_fixture("plain", &[2, 3], &[3, 2], Some(&[2, 2]));
    assert_eq!(fixture.required_capability, None);
    let report = MatmulSuite::new(fixture, &seeded_config(4))
        .with_probe(|| false)
        .run();
    assert!(!report.gate.is_skip());
    assert_eq!(report.passed, 1);
}

#[test]
fn suite_run_writes_one_jsonl_line_per_case() {
    let dir = std::env::temp_dir().join(format!("tc-optest-jsonl-{}", std::process::id()));
    let path = dir.join("matmul.jsonl");
    let config = HarnessConfig {
        log_path: Some(path.clone()),
        ..seeded_config(21)
    };

    let report = run_matmul_suite(&config).expect("suite runs");
    let raw = fs::read_to_string(&path).expect("log written");
    let lines: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines.len(), report.total);
    for (line, case) in lines.iter().zip(&report.cases) {
        assert_eq!(line["case_id"], Value::from(case.case.as_str()));
        assert_eq!(line["outcome"], Value::from(case.verdict.label()));
        assert_eq!(line["seed"], Value::from(21u64));
        assert!(line["state_trail"].is_array());
        assert!(line["runtime_evidence"].is_array());
    }
    assert_eq!(
        report.gate.is_skip(),
        !tc_device::probe(Capability::NvGpu)
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn nvgpu_target_follows_build_capability() {
    let report = bundled_suite(8).run();
    if tc_device::is_compiled_with_nvgpu() {
        assert!(report.is_green(), "{report:#?}");
        return;
    }
    assert_eq!(report.failed, report.total);
    for case in &report.cases {
        assert_eq!(case.forensic_log.reason_code, "compilation_error");
        assert_eq!(
            case.state_trail,
            vec![
                CaseState::Init,
                CaseState::BuiltReference,
                CaseState::BuiltCompiled,
                CaseState::Fail
            ]
        );
    }
}

#[test]
fn tolerance_violation_fails_with_full_diagnostic() {
    let tolerance = ToleranceSpec {
        atol: -1.0,
        rtol: 0.0,
        check_grads: true,
    };
    let fixture = single_case_fixture("too_strict", &[4, 16], &[16, 32], Some(&[4, 32]));
    let report = MatmulSuite::new(fixture, &seeded_config(13))
        .with_tolerance(tolerance)
        .run();
    let case = report.case("too_strict").expect("case reported");

    assert_eq!(case.verdict, Verdict::Fail);
    assert_eq!(
        case.state_trail,
        vec![
            CaseState::Init,
            CaseState::BuiltReference,
            CaseState::BuiltCompiled,
            CaseState::ExecutedBoth,
            CaseState::Compared,
            CaseState::Fail
        ]
    );
    assert_eq!(case.forensic_log.reason_code, "tolerance_violation");
    let diagnostic = case.diagnostic.as_deref().expect("diagnostic");
    for needle in [
        "case `too_strict`",
        "output 0",
        "max |diff|=",
        "atol=-1e0",
        "rtol=0e0",
        "A[4, 16] B[16, 32]",
    ] {
        assert!(diagnostic.contains(needle), "`{needle}` missing from {diagnostic}");
    }
    assert_eq!(report.failed, 1);
}

#[test]
fn target_capability_gates_when_fixture_names_none() {
    let fixture = fixture_on(Arch::NvGpu, "on_gpu", &[2, 3], &[3, 2], None);
    let suite = MatmulSuite::new(fixture, &seeded_config(9)).with_probe(|| false);
    assert_eq!(suite.gate().required(), Some(Capability::NvGpu));

    let report = suite.run();
    assert_eq!(report.skipped, 1);
    assert_eq!(
        report.gate,
        GateDecision::Skip {
            reason: "target(nvgpu) requires a build with nvgpu".to_owned()
        }
    );
}
