use kiln_core::{CompileError, CompileRequest, Compiler};
use kiln_manifest::VariableValue;
use kiln_policy::SearchConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let fixture = Self { root };
        fixture.write(
            "include/distro/cs9.ipp.yml",
            "# CentOS Stream 9\ndistro_version: \"9\"\nrootfs_rpms: !extend [basesystem]\n",
        );
        fixture.write(
            "include/targets/ebbr.ipp.yml",
            "# Generic EBBR board\nkernel_cmdline: console=ttyS0\n",
        );
        fixture.write("include/modes/image.ipp.yml", "# Full image build\n");
        fixture.write("include/modes/package.ipp.yml", "# Package-only build\n");
        fixture
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn compiler(&self) -> Compiler {
        let policies = self.root.path().join("policies");
        fs::create_dir_all(&policies).unwrap();
        Compiler::new(
            vec![self.root.path().join("include")],
            SearchConfig::new(self.root.path(), &policies, &policies),
        )
    }

    fn request(&self, manifest: &Path) -> CompileRequest {
        CompileRequest {
            manifest: manifest.to_path_buf(),
            distro: "cs9".to_owned(),
            target: "ebbr".to_owned(),
            mode: "image".to_owned(),
            arch: "aarch64".to_owned(),
            policy: None,
            defines: Vec::new(),
            extend_defines: Vec::new(),
            define_files: Vec::new(),
        }
    }
}

const SIMPLE_MANIFEST: &str = "\
name: demo
content:
  rpms: [vim, openssh-server]
network:
  hostname: demo-host
kernel:
  modules: [vcan]
";

#[test]
fn simple_manifest_composes_into_a_plan() {
    let fixture = Fixture::new();
    let manifest = fixture.write("demo.aib.yml", SIMPLE_MANIFEST);

    let result = fixture.compiler().compile(&fixture.request(&manifest)).unwrap();
    assert_eq!(result.policy, None);

    let json = result.plan.to_json_pretty().unwrap();
    assert!(json.contains("\"vim\""), "{json}");
    assert!(json.contains("\"basesystem\""), "{json}");
    assert!(json.contains("demo-host"), "{json}");
    assert!(json.contains("console=ttyS0"), "{json}");

    assert_eq!(
        result.variables.get("distro_version"),
        Some(&VariableValue::from("9"))
    );
    assert_eq!(result.variables.get("name"), Some(&VariableValue::from("demo")));
}

#[test]
fn computed_variables_span_layers() {
    let fixture = Fixture::new();
    let manifest = fixture.write(
        "img.mpp.yml",
        "mpp-vars:\n  image_name: !format \"${name}-${distro_name}-${arch}\"\npipelines:\n  - name: rootfs\n    stages:\n      - type: org.osbuild.tag\n        options:\n          label: \"${image_name}\"\n",
    );

    let result = fixture.compiler().compile(&fixture.request(&manifest)).unwrap();
    let json = result.plan.to_json_pretty().unwrap();
    assert!(json.contains("img-cs9-aarch64"), "{json}");
}

#[test]
fn defines_outrank_the_manifest() {
    let fixture = Fixture::new();
    let manifest = fixture.write("demo.aib.yml", SIMPLE_MANIFEST);

    let mut request = fixture.request(&manifest);
    request.defines.push("hostname=other-host".to_owned());
    request.extend_defines.push("rootfs_rpms=strace".to_owned());

    let result = fixture.compiler().compile(&request).unwrap();
    assert_eq!(
        result.variables.get("hostname"),
        Some(&VariableValue::from("other-host"))
    );
    let rpms = result
        .variables
        .get("rootfs_rpms")
        .and_then(VariableValue::as_sequence)
        .unwrap();
    assert!(rpms.contains(&VariableValue::from("strace")));
}

#[test]
fn define_files_sit_between_manifest_and_defines() {
    let fixture = Fixture::new();
    let manifest = fixture.write("demo.aib.yml", SIMPLE_MANIFEST);
    let defines = fixture.write("extra.yml", "hostname: from-file\nextra_var: 7\n");

    let mut request = fixture.request(&manifest);
    request.define_files.push(defines);
    request.defines.push("hostname=from-cli".to_owned());

    let result = fixture.compiler().compile(&request).unwrap();
    assert_eq!(
        result.variables.get("hostname"),
        Some(&VariableValue::from("from-cli"))
    );
    assert_eq!(result.variables.get("extra_var"), Some(&VariableValue::Int(7)));
}

#[test]
fn missing_include_names_the_searched_paths() {
    let fixture = Fixture::new();
    let manifest = fixture.write("demo.aib.yml", SIMPLE_MANIFEST);

    let mut request = fixture.request(&manifest);
    request.target = "nonexistent".to_owned();

    let err = fixture.compiler().compile(&request).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("target 'nonexistent' not found"), "{msg}");
    assert!(msg.contains("nonexistent.ipp.yml"), "{msg}");
}

#[test]
fn denylist_applies_without_a_policy() {
    let fixture = Fixture::new();
    fixture.write(
        "include/distro/denying.ipp.yml",
        "rootfs_rpms: !extend [basesystem]\ndenylist_rpms: !extend [telnet]\n",
    );
    let manifest = fixture.write(
        "demo.aib.yml",
        "name: demo\ncontent:\n  rpms: [telnet]\n",
    );

    let mut request = fixture.request(&manifest);
    request.distro = "denying".to_owned();

    let err = fixture.compiler().compile(&request).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Rootfs contains denied rpms: telnet"), "{msg}");
}

const POLICY: &str = "\
name: hardened
restrictions:
  modes:
    allow: [image]
  variables:
    force:
      hostname: locked-host
  kernel_modules:
    disallow: [bluetooth]
    disallow@ebbr: [vcan]
  sysctl:
    force:
      kernel.dmesg_restrict: \"1\"
  manifest:
    forbidden_properties: [experimental]
";

#[test]
fn policy_forced_value_outranks_cli_define() {
    let fixture = Fixture::new();
    fixture.write("policies/hardened.aibp.yml", POLICY);
    let manifest = fixture.write(
        "demo.aib.yml",
        "name: demo\ncontent:\n  rpms: [vim]\n",
    );

    let mut request = fixture.request(&manifest);
    request.policy = Some("hardened".to_owned());
    request.defines.push("hostname=my-host".to_owned());

    let result = fixture.compiler().compile(&request).unwrap();
    assert_eq!(result.policy.as_deref(), Some("hardened"));
    assert_eq!(
        result.variables.get("hostname"),
        Some(&VariableValue::from("locked-host"))
    );
    let json = result.plan.to_json_pretty().unwrap();
    assert!(json.contains("locked-host"), "{json}");
    assert!(json.contains("kernel.dmesg_restrict"), "{json}");
}

#[test]
fn policy_denies_target_scoped_kernel_module() {
    let fixture = Fixture::new();
    fixture.write("policies/hardened.aibp.yml", POLICY);
    let manifest = fixture.write("demo.aib.yml", SIMPLE_MANIFEST);

    let mut request = fixture.request(&manifest);
    request.policy = Some("hardened".to_owned());

    let err = fixture.compiler().compile(&request).unwrap_err();
    assert!(err.is_policy_failure());
    let msg = err.to_string();
    assert!(
        msg.contains("Rootfs contains denied kernel modules: vcan"),
        "{msg}"
    );
}

#[test]
fn policy_rejects_disallowed_mode() {
    let fixture = Fixture::new();
    fixture.write("policies/hardened.aibp.yml", POLICY);
    let manifest = fixture.write(
        "demo.aib.yml",
        "name: demo\ncontent:\n  rpms: [vim]\n",
    );

    let mut request = fixture.request(&manifest);
    request.policy = Some("hardened".to_owned());
    request.mode = "package".to_owned();

    let err = fixture.compiler().compile(&request).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Policy validation failed"), "{msg}");
    assert!(msg.contains("mode 'package' is not in allowed list"), "{msg}");
}

#[test]
fn policy_requiring_simple_manifest_rejects_low_level_input() {
    let fixture = Fixture::new();
    fixture.write(
        "policies/strict.aibp.yml",
        "name: strict\nrestrictions:\n  require_simple_manifest: true\n",
    );
    let manifest = fixture.write(
        "img.mpp.yml",
        "pipelines:\n  - name: rootfs\n    stages: []\n",
    );

    let mut request = fixture.request(&manifest);
    request.policy = Some("strict".to_owned());

    let err = fixture.compiler().compile(&request).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("simple manifest (.aib.yml)"), "{msg}");
    assert!(msg.contains("low-level manifest (.mpp.yml)"), "{msg}");
}

#[test]
fn policy_rejects_forbidden_property_in_plan() {
    let fixture = Fixture::new();
    fixture.write("policies/hardened.aibp.yml", POLICY);
    let manifest = fixture.write(
        "demo.aib.yml",
        "name: demo\nexperimental: true\n",
    );

    let mut request = fixture.request(&manifest);
    request.policy = Some("hardened".to_owned());

    let err = fixture.compiler().compile(&request).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("forbidden property 'experimental'"), "{msg}");
}

#[test]
fn missing_policy_is_reported_with_search_paths() {
    let fixture = Fixture::new();
    let manifest = fixture.write(
        "demo.aib.yml",
        "name: demo\ncontent:\n  rpms: [vim]\n",
    );

    let mut request = fixture.request(&manifest);
    request.policy = Some("missing".to_owned());

    let err = fixture.compiler().compile(&request).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Policy file not found: missing"), "{msg}");
}
