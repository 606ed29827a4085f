/*
 * Copyright 2023 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, ColorChoice, Parser};

use crate::runtime::docker::DockerAdapter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = None,
    propagate_version = true,
    color = ColorChoice::Auto,
)]
pub struct Cli {
    /// Directory holding config.json, events.json and the other persisted
    /// state files. Created on first run if it doesn't exist.
    #[arg(
        long = "data-dir",
        value_name = "PATH",
        default_value = "/var/lib/autoheal",
        env = "AUTOHEAL_DATA_DIR"
    )]
    pub data_dir: PathBuf,
    #[arg(
        long = "bind",
        value_name = "ADDRESS",
        default_value_t = SocketAddr::new(IpAddr::from(Ipv4Addr::UNSPECIFIED), 8080),
        env = "AUTOHEAL_BIND_ADDRESS",
    )]
    pub bind_address: SocketAddr,
    #[arg(
        long = "prometheus",
        value_name = "ADDRESS",
        default_value_t = SocketAddr::new(IpAddr::from(Ipv4Addr::UNSPECIFIED), 9092),
        env = "AUTOHEAL_PROMETHEUS_ADDRESS",
    )]
    pub prometheus_address: SocketAddr,
    #[command(flatten, next_help_heading = "Docker connection")]
    pub connection: DockerConnection,
}

#[derive(Args, Debug)]
#[group(required = false, multiple = false)]
pub struct DockerConnection {
    #[arg(
        long = "unix-socket",
        value_name = "PATH",
        env = "AUTOHEAL_DOCKER_UNIX_SOCKET"
    )]
    unix_socket: Option<String>,
    #[arg(long = "http", value_name = "URL", env = "AUTOHEAL_DOCKER_HTTP_URL")]
    http_url: Option<String>,
}

impl DockerConnection {
    fn unix_connection(&self) -> Option<Result<DockerAdapter, crate::runtime::AdapterError>> {
        self.unix_socket
            .as_ref()
            .map(|path| DockerAdapter::connect_unix(path))
    }

    fn http_connection(&self) -> Option<Result<DockerAdapter, crate::runtime::AdapterError>> {
        self.http_url.as_ref().map(|url| DockerAdapter::connect_http(url))
    }

    pub fn connect(&self) -> Result<DockerAdapter, crate::runtime::AdapterError> {
        self.unix_connection()
            .or_else(|| self.http_connection())
            .unwrap_or_else(DockerAdapter::connect_local_defaults)
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use crate::cli::Cli;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }
}
