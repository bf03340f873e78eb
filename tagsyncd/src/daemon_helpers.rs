fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_path_env(name: &str, home: &Path) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| expand_with_home(value.trim(), home))
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn default_state_file() -> anyhow::Result<PathBuf> {
    let data_dir = dirs::data_dir().context("platform data directory is unavailable")?;
    Ok(data_dir.join("tagsync").join("state.json"))
}

fn status_line(status: SyncStatus, last_error: Option<&str>) -> String {
    match (status, last_error) {
        (SyncStatus::Error, Some(err)) => format!("{status}: {err}"),
        _ => status.to_string(),
    }
}

fn report_line(report: &PassReport) -> String {
    format!(
        "downloaded={} uploaded={} deleted_local={} deleted_remote={} conflicts={} skipped={}",
        report.downloaded,
        report.uploaded,
        report.deleted_local,
        report.deleted_remote,
        report.conflicts,
        report.skipped_oversize
    )
}
