use sdb_bridge::ExecutionParameters;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Launch arguments for DAP launch configuration. The same object is passed
/// to the bridge as the launch payload, so target options such as `host` and
/// `port` live next to these.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArgs {
    #[serde(alias = "exe", alias = "targetExeFileName")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchArgs {
    pub fn execution_parameters(&self) -> ExecutionParameters {
        ExecutionParameters {
            server: None,
            executable: self.program.clone(),
            args: self.args.clone(),
            working_dir: self.cwd.clone(),
            env: self
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            launch_flags: 0,
        }
    }
}

/// Payload handed to `LaunchSuspended`: the client's launch object with the
/// program filled in as the target executable when no alias names it.
pub fn launch_options(raw: &serde_json::Value, args: &LaunchArgs) -> String {
    let mut options = raw.clone();
    if let Some(map) = options.as_object_mut()
        && !map.contains_key("exe")
        && !map.contains_key("targetExeFileName")
    {
        map.insert(
            "exe".to_string(),
            serde_json::Value::String(args.program.clone()),
        );
    }
    options.to_string()
}
