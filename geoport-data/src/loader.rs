//! Bulk loading of vector layers into PostGIS through `ogr2ogr`.
//!
//! The loader is an external process invoked with an explicit argument
//! vector; nothing is routed through a shell. Any output on stderr is
//! treated as a failure because `ogr2ogr` reports many data errors as
//! warnings while still exiting with status zero.
#![forbid(unsafe_code)]

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// Default location of the `ogr2ogr` binary.
pub const DEFAULT_OGR2OGR: &str = "/usr/bin/ogr2ogr";

/// Default upper bound on a single load.
pub const DEFAULT_LOADER_TIMEOUT: Duration = Duration::from_secs(3600);

/// PostgreSQL connection settings handed to the loader.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Database name.
    pub dbname: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login role.
    pub user: String,
    /// Login password.
    pub password: String,
}

impl ConnectionParams {
    /// OGR PostgreSQL datasource string.
    ///
    /// Values that may contain spaces or quotes are single-quoted with
    /// libpq escaping.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoport_data::ConnectionParams;
    ///
    /// let params = ConnectionParams {
    ///     dbname: "geo data".into(),
    ///     host: "localhost".into(),
    ///     port: 5432,
    ///     user: "importer".into(),
    ///     password: "it's".into(),
    /// };
    /// assert_eq!(
    ///     params.datasource(),
    ///     r"PG: dbname='geo data' host=localhost port=5432 user='importer' password='it\'s'"
    /// );
    /// ```
    #[must_use]
    pub fn datasource(&self) -> String {
        format!(
            "PG: dbname={} host={} port={} user={} password={}",
            quote_conninfo(&self.dbname),
            self.host,
            self.port,
            quote_conninfo(&self.user),
            quote_conninfo(&self.password),
        )
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("dbname", &self.dbname)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

fn quote_conninfo(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if matches!(ch, '\'' | '\\') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// One layer to copy from a source dataset into a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Source dataset on disk.
    pub source: Utf8PathBuf,
    /// Layer name inside the dataset.
    pub layer: String,
    /// Target table name.
    pub alternate: String,
    /// Replace the target table if it exists.
    pub overwrite: bool,
}

/// Outcome of a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Captured standard output.
    pub stdout: String,
    /// Wall-clock duration of the load.
    pub elapsed: Duration,
}

/// Errors raised by [`DataLoader`] implementations.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The loader process could not be started.
    #[error("failed to start loader {program}: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting for the loader failed.
    #[error("failed to wait for loader {program}: {source}")]
    Wait {
        /// Program that was executed.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The loader wrote to stderr.
    #[error("{stderr}")]
    Stderr {
        /// Trimmed stderr content.
        stderr: String,
        /// Exit code, when the process exited normally.
        code: Option<i32>,
    },
    /// The loader exited unsuccessfully without writing to stderr.
    #[error("loader exited with status {code:?}")]
    ExitStatus {
        /// Exit code, when the process exited normally.
        code: Option<i32>,
    },
    /// The loader ran past its deadline and was killed.
    #[error("loader timed out after {}s and was killed", timeout.as_secs())]
    Timeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

impl LoaderError {
    /// Whether repeating the load may succeed.
    ///
    /// Data errors reported on stderr are deterministic and not retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::Wait { .. } | Self::Timeout { .. }
        )
    }
}

/// Copies a layer from a dataset into the target store.
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Run one load to completion.
    async fn load(&self, request: &LoadRequest) -> Result<LoadReport, LoaderError>;
}

/// [`DataLoader`] that shells out to GDAL's `ogr2ogr`.
#[derive(Debug, Clone)]
pub struct Ogr2OgrLoader {
    binary: Utf8PathBuf,
    launcher: Option<(String, Vec<String>)>,
    connection: ConnectionParams,
    timeout: Duration,
}

impl Ogr2OgrLoader {
    /// Loader invoking `binary` against `connection`.
    #[must_use]
    pub fn new(binary: impl Into<Utf8PathBuf>, connection: ConnectionParams) -> Self {
        Self {
            binary: binary.into(),
            launcher: None,
            connection,
            timeout: DEFAULT_LOADER_TIMEOUT,
        }
    }

    /// Override the load deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `ogr2ogr` through a launcher such as `nice` or a container
    /// runtime. The binary and its arguments follow `args`.
    #[must_use]
    pub fn with_launcher(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.launcher = Some((program.into(), args));
        self
    }

    /// Binary invoked for each load.
    #[must_use]
    pub fn binary(&self) -> &Utf8Path {
        &self.binary
    }

    /// Arguments passed to `ogr2ogr` for `request`.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoport_data::{ConnectionParams, LoadRequest, Ogr2OgrLoader};
    ///
    /// let loader = Ogr2OgrLoader::new("/usr/bin/ogr2ogr", ConnectionParams::default());
    /// let args = loader.command_args(&LoadRequest {
    ///     source: "/data/roads.gpkg".into(),
    ///     layer: "roads".into(),
    ///     alternate: "roads_2".into(),
    ///     overwrite: false,
    /// });
    /// assert_eq!(args.first().map(String::as_str), Some("--config"));
    /// assert!(!args.iter().any(|a| a == "-overwrite"));
    /// ```
    #[must_use]
    pub fn command_args(&self, request: &LoadRequest) -> Vec<String> {
        let mut args = vec![
            "--config".to_owned(),
            "PG_USE_COPY".to_owned(),
            "YES".to_owned(),
            "-f".to_owned(),
            "PostgreSQL".to_owned(),
            self.connection.datasource(),
            request.source.to_string(),
            "-lco".to_owned(),
            "DIM=2".to_owned(),
            "-nln".to_owned(),
            request.alternate.clone(),
            request.layer.clone(),
        ];
        if request.overwrite {
            args.push("-overwrite".to_owned());
        }
        args
    }

    fn command(&self, request: &LoadRequest) -> (String, Command) {
        let args = self.command_args(request);
        match &self.launcher {
            Some((program, launcher_args)) => {
                let mut command = Command::new(program);
                command.args(launcher_args).arg(self.binary.as_str()).args(args);
                (program.clone(), command)
            }
            None => {
                let mut command = Command::new(self.binary.as_std_path());
                command.args(args);
                (self.binary.to_string(), command)
            }
        }
    }
}

#[async_trait]
impl DataLoader for Ogr2OgrLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadReport, LoaderError> {
        let (program, mut command) = self.command(request);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(
            "loading layer {} from {} into {} (overwrite: {})",
            request.layer, request.source, request.alternate, request.overwrite
        );

        let started = Instant::now();
        let child = command.spawn().map_err(|source| LoaderError::Spawn {
            program: program.clone(),
            source,
        })?;
        // Dropping the pending future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| LoaderError::Timeout {
                timeout: self.timeout,
            })?
            .map_err(|source| LoaderError::Wait { program, source })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if !stderr.is_empty() {
            return Err(LoaderError::Stderr {
                stderr,
                code: output.status.code(),
            });
        }
        if !output.status.success() {
            return Err(LoaderError::ExitStatus {
                code: output.status.code(),
            });
        }
        let elapsed = started.elapsed();
        info!(
            "loaded layer {} into {} in {}ms",
            request.layer,
            request.alternate,
            elapsed.as_millis()
        );
        Ok(LoadReport {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn request() -> LoadRequest {
        LoadRequest {
            source: "/data/my roads.gpkg".into(),
            layer: "roads".into(),
            alternate: "roads_1c9a".into(),
            overwrite: false,
        }
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            dbname: "geoport".into(),
            host: "db".into(),
            port: 5432,
            user: "loader".into(),
            password: "s3cret".into(),
        }
    }

    fn scripted(script: &str) -> Ogr2OgrLoader {
        Ogr2OgrLoader::new("ogr2ogr", params())
            .with_launcher("sh", vec!["-c".into(), script.into()])
    }

    #[rstest]
    fn argv_keeps_paths_with_spaces_as_single_arguments(request: LoadRequest) {
        let loader = Ogr2OgrLoader::new(DEFAULT_OGR2OGR, params());
        let args = loader.command_args(&request);

        assert_eq!(
            args,
            vec![
                "--config",
                "PG_USE_COPY",
                "YES",
                "-f",
                "PostgreSQL",
                "PG: dbname='geoport' host=db port=5432 user='loader' password='s3cret'",
                "/data/my roads.gpkg",
                "-lco",
                "DIM=2",
                "-nln",
                "roads_1c9a",
                "roads",
            ]
        );
    }

    #[rstest]
    #[case(false, false)]
    #[case(true, true)]
    fn overwrite_flag_follows_request(
        mut request: LoadRequest,
        #[case] overwrite: bool,
        #[case] expected: bool,
    ) {
        request.overwrite = overwrite;
        let args = Ogr2OgrLoader::new(DEFAULT_OGR2OGR, params()).command_args(&request);
        assert_eq!(args.last().map(String::as_str) == Some("-overwrite"), expected);
    }

    #[rstest]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", params());
        assert!(!rendered.contains("s3cret"));
    }

    #[rstest]
    #[tokio::test]
    async fn stdout_only_run_succeeds(request: LoadRequest) {
        let report = scripted("echo loaded").load(&request).await.expect("load");
        assert_eq!(report.stdout.trim(), "loaded");
    }

    #[rstest]
    #[tokio::test]
    async fn stderr_fails_even_with_zero_exit(request: LoadRequest) {
        let err = scripted("echo 'ERROR 1: relation exists' >&2; exit 0")
            .load(&request)
            .await
            .expect_err("stderr should fail the load");
        match err {
            LoaderError::Stderr { stderr, code } => {
                assert_eq!(stderr, "ERROR 1: relation exists");
                assert_eq!(code, Some(0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn silent_non_zero_exit_is_reported(request: LoadRequest) {
        let err = scripted("exit 3")
            .load(&request)
            .await
            .expect_err("exit status should fail the load");
        assert!(matches!(err, LoaderError::ExitStatus { code: Some(3) }));
    }

    #[rstest]
    #[tokio::test]
    async fn timeout_kills_the_loader(request: LoadRequest) {
        let loader = scripted("sleep 30").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = loader.load(&request).await.expect_err("timeout");

        assert!(matches!(err, LoaderError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[rstest]
    #[tokio::test]
    async fn missing_binary_is_a_spawn_error(request: LoadRequest) {
        let loader = Ogr2OgrLoader::new("/nonexistent/geoport/ogr2ogr", params());
        let err = loader.load(&request).await.expect_err("spawn failure");
        assert!(matches!(err, LoaderError::Spawn { .. }));
    }
}
