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

//! Free-standing HTTP and TCP reachability probes. These do not need a
//! runtime handle, unlike `probe_exec` which must run inside a container.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::AdapterError;

pub async fn probe_http(
    url: &str,
    expected_status: u16,
    timeout_dur: Duration,
) -> Result<(), AdapterError> {
    let client = reqwest::Client::builder()
        .timeout(timeout_dur)
        .build()
        .map_err(|e| AdapterError::Other(e.to_string()))?;
    match client.get(url).send().await {
        Ok(resp) if resp.status().as_u16() == expected_status => Ok(()),
        Ok(resp) => Err(AdapterError::Other(format!(
            "unexpected status {}",
            resp.status()
        ))),
        Err(e) if e.is_timeout() => Err(AdapterError::Timeout),
        Err(e) => Err(AdapterError::Other(e.to_string())),
    }
}

pub async fn probe_tcp(host: &str, port: u16, timeout_dur: Duration) -> Result<(), AdapterError> {
    match timeout(timeout_dur, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(AdapterError::Other(e.to_string())),
        Err(_) => Err(AdapterError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let result = probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn tcp_probe_fails_against_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
