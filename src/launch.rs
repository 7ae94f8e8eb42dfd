use std::path::PathBuf;

use crate::registry::GridLayout;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub backend_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Series ids in the order the viewer should list them.
    pub series: Vec<String>,
    pub primary: Option<String>,
    pub layout: Option<GridLayout>,
    pub paths: Vec<PathBuf>,
}

impl LaunchRequest {
    fn validate(mut self) -> Result<Self, String> {
        if self.username.is_some() ^ self.password.is_some() {
            return Err("Backend credentials must include both user and password.".to_string());
        }
        if self.username.is_some() && self.backend_url.is_none() {
            return Err("Backend credentials were provided without a backend URL.".to_string());
        }
        if let Some(primary) = self.primary.as_ref() {
            if !self.series.contains(primary) {
                self.series.insert(0, primary.clone());
            }
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty() && self.paths.is_empty()
    }
}

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    if args.len() == 1 && is_radview_uri(&args[0]) {
        return parse_radview_uri(&args[0]).map(Some);
    }

    let mut request = LaunchRequest::default();
    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        match arg {
            "--backend" | "--user" | "--password" | "--series" | "--primary" | "--layout" => {
                let value = args
                    .get(index + 1)
                    .filter(|value| !value.starts_with("--"))
                    .ok_or_else(|| format!("Missing value after {arg}."))?
                    .trim()
                    .to_string();
                match arg {
                    "--backend" => request.backend_url = Some(value),
                    "--user" => request.username = Some(value),
                    "--password" => request.password = Some(value),
                    "--series" => request.series.push(value),
                    "--primary" => request.primary = Some(value),
                    _ => request.layout = Some(parse_layout(&value)?),
                }
                index += 2;
            }
            "--open" => {
                let start = index + 1;
                let mut end = start;
                while end < args.len() && !args[end].starts_with("--") {
                    end += 1;
                }
                if end == start {
                    return Err("Missing file path(s) after --open.".to_string());
                }
                request
                    .paths
                    .extend(args[start..end].iter().map(PathBuf::from));
                index = end;
            }
            flag if flag.starts_with("--") => return Err(format!("Unknown option {flag}.")),
            path => {
                request.paths.push(PathBuf::from(path));
                index += 1;
            }
        }
    }

    request.validate().map(Some)
}

pub fn parse_radview_uri(uri: &str) -> Result<LaunchRequest, String> {
    let rest =
        strip_radview_scheme(uri).ok_or_else(|| "URL must start with radview://".to_string())?;

    let (location, query) = split_location_and_query(rest);
    let mut request = LaunchRequest::default();

    if let Some(path_from_location) = parse_location_path(location)? {
        request.paths.push(PathBuf::from(path_from_location));
    }

    if let Some(query_string) = query {
        for pair in query_string.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim().to_ascii_lowercase();
            let decoded_value = percent_decode(value)?;
            let trimmed = decoded_value.trim();
            if trimmed.is_empty() {
                continue;
            }
            match key.as_str() {
                "path" | "file" => request.paths.push(PathBuf::from(trimmed)),
                "paths" | "files" => request.paths.extend(
                    split_list(trimmed)
                        .into_iter()
                        .filter(|path| !path.trim().is_empty())
                        .map(PathBuf::from),
                ),
                "series" | "series_id" | "seriesid" => request.series.extend(
                    split_list(trimmed)
                        .into_iter()
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                ),
                "primary" | "primary_series" => request.primary = Some(trimmed.to_string()),
                "layout" | "grid" => request.layout = Some(parse_layout(trimmed)?),
                "backend" | "backend_url" | "api" | "base_url" => {
                    request.backend_url = Some(trimmed.to_string());
                }
                "user" | "username" => request.username = Some(trimmed.to_string()),
                "pass" | "password" => request.password = Some(trimmed.to_string()),
                "auth" => {
                    let Some((user, pass)) = trimmed.split_once(':') else {
                        return Err(
                            "auth must be encoded as username:password (percent-encoded)."
                                .to_string(),
                        );
                    };
                    if !user.trim().is_empty() {
                        request.username = Some(user.trim().to_string());
                    }
                    if !pass.trim().is_empty() {
                        request.password = Some(pass.trim().to_string());
                    }
                }
                _ => log::debug!("ignoring launch parameter {key}"),
            }
        }
    }

    let request = request.validate()?;
    if request.is_empty() {
        return Err(
            "No series or DICOM path found in URL. Use series=..., path=..., or paths=..."
                .to_string(),
        );
    }
    Ok(request)
}

fn parse_layout(value: &str) -> Result<GridLayout, String> {
    GridLayout::parse(value)
        .ok_or_else(|| format!("Unknown layout '{value}'. Use 1x1, 1x2 or 2x2."))
}

fn is_radview_uri(value: &str) -> bool {
    strip_radview_scheme(value).is_some()
}

fn strip_radview_scheme(uri: &str) -> Option<&str> {
    let prefix = "radview://";
    if uri.len() >= prefix.len() && uri[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&uri[prefix.len()..])
    } else {
        None
    }
}

fn split_location_and_query(value: &str) -> (&str, Option<&str>) {
    if let Some((location, query)) = value.split_once('?') {
        (location, Some(query))
    } else {
        (value, None)
    }
}

fn parse_location_path(location: &str) -> Result<Option<String>, String> {
    let location = location.trim().trim_end_matches('/');
    if location.is_empty() {
        return Ok(None);
    }

    let lower = location.to_ascii_lowercase();
    if lower == "open" {
        return Ok(None);
    }

    if lower.starts_with("open/") {
        let decoded = percent_decode(&location[5..])?;
        if decoded.trim().is_empty() {
            return Ok(None);
        }
        return Ok(Some(decoded));
    }

    Ok(Some(percent_decode(location)?))
}

fn split_list(value: &str) -> Vec<&str> {
    if value.contains('|') {
        value.split('|').collect()
    } else {
        value.split(',').collect()
    }
}

fn percent_decode(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                if index + 2 >= bytes.len() {
                    return Err("Invalid percent-encoding in URL.".to_string());
                }
                let hi = decode_hex_digit(bytes[index + 1])
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                let lo = decode_hex_digit(bytes[index + 2])
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                decoded.push((hi << 4) | lo);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| "URL contains invalid UTF-8 after decoding.".to_string())
}

fn decode_hex_digit(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parse_backend_series_request() {
        let request = parse_radview_uri(
            "radview://open?backend=http%3A%2F%2Fpacs.local%3A8080%2Fapi&series=s1,s2&primary=s2&layout=1x2",
        )
        .expect("URI should parse");
        assert_eq!(
            request,
            LaunchRequest {
                backend_url: Some("http://pacs.local:8080/api".to_string()),
                series: vec!["s1".to_string(), "s2".to_string()],
                primary: Some("s2".to_string()),
                layout: Some(GridLayout::SideBySide),
                ..LaunchRequest::default()
            }
        );
    }

    #[test]
    fn parse_repeated_path_params() {
        let request = parse_radview_uri("radview://open?path=data%2Fa.dcm&path=data%2Fb.dcm")
            .expect("URI should parse");
        assert_eq!(
            request.paths,
            vec![PathBuf::from("data/a.dcm"), PathBuf::from("data/b.dcm")]
        );
    }

    #[test]
    fn parse_location_path_after_open() {
        let request =
            parse_radview_uri("radview://open/data%2Fc.dcm").expect("URI should parse");
        assert_eq!(request.paths, vec![PathBuf::from("data/c.dcm")]);
    }

    #[test]
    fn auth_splits_into_credentials() {
        let request = parse_radview_uri(
            "radview://open?backend=http%3A%2F%2Fpacs&series=s1&auth=viewer%3Asecret",
        )
        .expect("URI should parse");
        assert_eq!(request.username.as_deref(), Some("viewer"));
        assert_eq!(request.password.as_deref(), Some("secret"));
    }

    #[test]
    fn credentials_need_both_parts_and_a_backend() {
        let error = parse_radview_uri("radview://open?backend=http%3A%2F%2Fpacs&series=s1&user=a")
            .expect_err("URI should fail");
        assert!(error.contains("both user and password"));

        let error = parse_radview_uri("radview://open?series=s1&user=a&password=b")
            .expect_err("URI should fail");
        assert!(error.contains("without a backend URL"));
    }

    #[test]
    fn empty_uri_is_rejected() {
        let error = parse_radview_uri("radview://open").expect_err("URI should fail");
        assert!(error.contains("No series or DICOM path"));
        assert!(parse_radview_uri("perspective://open?series=s1").is_err());
    }

    #[test]
    fn primary_is_listed_even_when_not_in_series() {
        let request = parse_radview_uri("radview://open?series=s1&primary=s9")
            .expect("URI should parse");
        assert_eq!(request.series, vec!["s9".to_string(), "s1".to_string()]);
    }

    #[test]
    fn parse_cli_flags() {
        let parsed = parse_launch_request_from_args(&args(&[
            "--backend",
            "http://pacs.local/api",
            "--series",
            "s1",
            "--series",
            "s2",
            "--layout",
            "2x2",
            "--open",
            "a.dcm",
            "b.dcm",
        ]))
        .expect("args should parse")
        .expect("request present");
        assert_eq!(parsed.backend_url.as_deref(), Some("http://pacs.local/api"));
        assert_eq!(parsed.series, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(parsed.layout, Some(GridLayout::Quad));
        assert_eq!(
            parsed.paths,
            vec![PathBuf::from("a.dcm"), PathBuf::from("b.dcm")]
        );
    }

    #[test]
    fn parse_cli_errors() {
        assert!(parse_launch_request_from_args(&args(&["--series"]))
            .expect_err("missing value")
            .contains("Missing value after --series"));
        assert!(parse_launch_request_from_args(&args(&["--open"]))
            .expect_err("missing paths")
            .contains("after --open"));
        assert!(parse_launch_request_from_args(&args(&["--layout", "3x3"]))
            .expect_err("bad layout")
            .contains("Unknown layout"));
        assert!(parse_launch_request_from_args(&args(&["--zoom", "2"])).is_err());
    }

    #[test]
    fn parse_cli_falls_back_to_raw_paths() {
        let parsed = parse_launch_request_from_args(&args(&["data/a.dcm", "data/b.dcm"]))
            .expect("args should parse");
        assert_eq!(
            parsed.map(|request| request.paths),
            Some(vec![PathBuf::from("data/a.dcm"), PathBuf::from("data/b.dcm")])
        );
        assert_eq!(parse_launch_request_from_args(&[]), Ok(None));
    }
}
