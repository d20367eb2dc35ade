//! Workload environment composition.

use crate::config::types::{Result, ShimConfig, StartupError};
use crate::utils::env_hygiene::{
    expand_vars, prepend_path, sanitize_loader_vars, validate_environment_safety, LOADER_VARS,
};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::Path;

/// Sorted `*.jar` files of `jars_dir`, joined with `:`.
///
/// A missing directory yields an empty classpath.
pub fn jar_classpath(jars_dir: &Path) -> Result<String> {
    let entries = match fs::read_dir(jars_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e.into()),
    };

    let mut jars: Vec<String> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "jar"))
        .map(|path| path.display().to_string())
        .collect();
    jars.sort();
    Ok(jars.join(":"))
}

/// Compose the workload environment from `base`.
///
/// Order: clear or inherit, drop loader variables, framework and java homes,
/// classpath, `PATH` prepend, configured values, required check.
///
/// `opaque` holds the inherited variables that are not UTF-8. They take no
/// part in expansion and are dropped when cleared, sanitized, or replaced by
/// a composed variable of the same name.
pub fn compose(
    config: &ShimConfig,
    base: BTreeMap<String, String>,
    opaque: &mut BTreeMap<OsString, OsString>,
) -> Result<BTreeMap<String, String>> {
    let env_config = &config.environment;
    let mut env = if env_config.clear {
        opaque.clear();
        BTreeMap::new()
    } else {
        base
    };

    if env_config.sanitize_loader_vars {
        sanitize_loader_vars(&mut env);
        opaque.retain(|key, _| {
            !LOADER_VARS
                .iter()
                .any(|var| key.as_os_str() == OsStr::new(var))
        });
    }

    env.insert(
        config.framework.home_env.clone(),
        config.framework.home.display().to_string(),
    );
    env.insert(
        config.java.home_env.clone(),
        config.java.home.display().to_string(),
    );

    let jars = jar_classpath(&config.framework.jars_path())?;
    let classpath = match env.get(&config.framework.classpath_env) {
        Some(existing) if !existing.is_empty() && !jars.is_empty() => {
            format!("{}:{}", jars, existing)
        }
        Some(existing) if !existing.is_empty() => existing.clone(),
        _ => jars,
    };
    if !classpath.is_empty() {
        env.insert(config.framework.classpath_env.clone(), classpath);
    }

    prepend_path(&mut env, &env_config.path_prepend);

    // BTreeMap order makes expansion deterministic; values set earlier in the
    // map are visible to later ones.
    for (key, value) in &env_config.set {
        let expanded = expand_vars(value, &env);
        env.insert(key.clone(), expanded);
    }

    let missing: Vec<&str> = env_config
        .required
        .iter()
        .filter(|name| env.get(*name).map_or(true, |v| v.is_empty()))
        .filter(|name| {
            opaque
                .get(OsStr::new(name.as_str()))
                .map_or(true, |v| v.is_empty())
        })
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(StartupError::Config(format!(
            "required environment variable(s) not set: {}",
            missing.join(", ")
        )));
    }

    for warning in validate_environment_safety(&env) {
        log::warn!("{}", warning);
    }

    opaque.retain(|key, _| key.to_str().map_or(true, |name| !env.contains_key(name)));
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn no_opaque() -> BTreeMap<OsString, OsString> {
        BTreeMap::new()
    }

    fn latin1(bytes: &[u8]) -> OsString {
        use std::os::unix::ffi::OsStringExt;
        OsString::from_vec(bytes.to_vec())
    }

    fn config_with_home(home: PathBuf) -> ShimConfig {
        let mut config = ShimConfig::default();
        config.framework.home = home;
        config
    }

    #[test]
    fn test_jar_classpath_sorted_jars_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jar", "a.jar", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("sub.jar")).unwrap();

        let cp = jar_classpath(dir.path()).unwrap();
        let expected = format!(
            "{}:{}",
            dir.path().join("a.jar").display(),
            dir.path().join("b.jar").display()
        );
        assert_eq!(cp, expected);
    }

    #[test]
    fn test_jar_classpath_missing_dir() {
        assert_eq!(jar_classpath(Path::new("/nonexistent/jars")).unwrap(), "");
    }

    #[test]
    fn test_compose_exports_homes_and_classpath() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("jars")).unwrap();
        fs::write(dir.path().join("jars").join("core.jar"), "").unwrap();

        let config = config_with_home(dir.path().to_path_buf());
        let inherited = base(&[("SPARK_CLASSPATH", "/extra/lib.jar")]);
        let env = compose(&config, inherited, &mut no_opaque()).unwrap();

        assert_eq!(env["SPARK_HOME"], dir.path().display().to_string());
        assert_eq!(env["JAVA_HOME"], "/usr/lib/jvm/java-8-openjdk-amd64");
        assert_eq!(
            env["SPARK_CLASSPATH"],
            format!("{}:/extra/lib.jar", dir.path().join("jars/core.jar").display())
        );
    }

    #[test]
    fn test_compose_clear_and_sanitize() {
        let mut config = config_with_home(PathBuf::from("/nonexistent/spark"));
        config.environment.sanitize_loader_vars = true;
        let env = compose(
            &config,
            base(&[("LD_PRELOAD", "/evil.so"), ("KEEP", "1")]),
            &mut no_opaque(),
        )
        .unwrap();
        assert!(!env.contains_key("LD_PRELOAD"));
        assert_eq!(env["KEEP"], "1");
        assert!(!env.contains_key("SPARK_CLASSPATH"));

        config.environment.clear = true;
        let env = compose(&config, base(&[("KEEP", "1")]), &mut no_opaque()).unwrap();
        assert!(!env.contains_key("KEEP"));
        assert!(env.contains_key("SPARK_HOME"));
    }

    #[test]
    fn test_compose_expands_set_values() {
        let mut config = config_with_home(PathBuf::from("/opt/spark"));
        config
            .environment
            .set
            .insert("SPARK_CONF_DIR".to_string(), "${SPARK_HOME}/conf".to_string());
        config.environment.path_prepend = vec!["/opt/spark/bin".to_string()];

        let env = compose(&config, base(&[("PATH", "/usr/bin")]), &mut no_opaque()).unwrap();
        assert_eq!(env["SPARK_CONF_DIR"], "/opt/spark/conf");
        assert_eq!(env["PATH"], "/opt/spark/bin:/usr/bin");
    }

    #[test]
    fn test_compose_required_missing() {
        let mut config = config_with_home(PathBuf::from("/opt/spark"));
        config.environment.required = vec![
            "SPARK_HOME".to_string(),
            "SGX_MEM_SIZE".to_string(),
            "EMPTY".to_string(),
        ];
        let err = compose(&config, base(&[("EMPTY", "")]), &mut no_opaque())
            .unwrap_err()
            .to_string();
        assert!(err.contains("SGX_MEM_SIZE"));
        assert!(err.contains("EMPTY"));
        assert!(!err.contains("SPARK_HOME,"));
    }

    #[test]
    fn test_compose_keeps_non_utf8_inherited_vars() {
        let mut config = config_with_home(PathBuf::from("/opt/spark"));
        config.environment.sanitize_loader_vars = true;
        config.environment.required = vec!["LEGACY_LOCALE".to_string()];
        let mut opaque = BTreeMap::new();
        opaque.insert(OsString::from("LEGACY_LOCALE"), latin1(b"caf\xe9"));
        opaque.insert(OsString::from("LD_PRELOAD"), latin1(b"/\xffevil.so"));
        opaque.insert(OsString::from("SPARK_HOME"), latin1(b"/old\xff"));

        let env = compose(&config, base(&[]), &mut opaque).unwrap();

        assert_eq!(env["SPARK_HOME"], "/opt/spark");
        assert_eq!(opaque.len(), 1);
        assert_eq!(opaque[OsStr::new("LEGACY_LOCALE")], latin1(b"caf\xe9"));
    }

    #[test]
    fn test_compose_clear_drops_non_utf8_vars() {
        let mut config = config_with_home(PathBuf::from("/opt/spark"));
        config.environment.clear = true;
        let mut opaque = BTreeMap::new();
        opaque.insert(OsString::from("LEGACY_LOCALE"), latin1(b"caf\xe9"));

        compose(&config, base(&[]), &mut opaque).unwrap();
        assert!(opaque.is_empty());
    }
}
