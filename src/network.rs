/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a
 * copy of this software and associated documentation files (the "Software"),
 * to deal in the Software without restriction, including without limitation
 * the rights to use, copy, modify, merge, publish, distribute, sublicense,
 * and/or sell copies of the Software, and to permit persons to whom the
 * Software is furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
 * THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
 * DEALINGS IN THE SOFTWARE.
 */
use std::{fmt, sync::Arc, time::Duration};

use reqwest::{
    blocking::Client as HttpClient, blocking::ClientBuilder as HttpClientBuilder,
    header::HeaderValue, header::CONTENT_TYPE, StatusCode,
};
use tracing::debug;
use xmltree::Element;

use crate::clock::{CancellationToken, Clock, Pacer, SystemClock};
use crate::ipmi::IpmiSession;
use crate::jobs::DEFAULT_POLL_INTERVAL;
use crate::transfer::{Compressor, TransferConfig};
use crate::wsman::WsmanClient;
use crate::{cisco, dell, ibm, xml, FirmwareConfig, FirmwareError, Vendor};

/// Path of the CIMC XML API on the controller.
pub const XML_API_ENDPOINT: &str = "nuova";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// The controller a client connects to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Endpoint {
    /// Hostname or IP address of the BMC
    pub host: String,
    /// If absent the protocol default port is used
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
}

impl Endpoint {
    pub fn new(host: &str, user: &str, password: &str) -> Self {
        Endpoint {
            host: host.to_string(),
            port: None,
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

/// Opens a collaborator (XML API transport, WS-Management client, IPMI
/// session) for an endpoint. Any `Fn(&Endpoint) -> Result<Box<T>, _>` works.
pub trait Connector<T: ?Sized>: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<T>, FirmwareError>;
}

impl<T: ?Sized, F> Connector<T> for F
where
    F: Fn(&Endpoint) -> Result<Box<T>, FirmwareError> + Send + Sync,
{
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<T>, FirmwareError> {
        self(endpoint)
    }
}

/// Request/response exchange of XML documents with a controller.
pub trait XmlApi: Send + Sync {
    fn request(&self, document: &Element) -> Result<Element, FirmwareError>;
}

pub struct ClientPoolBuilder {
    timeout: Duration,
    accept_invalid_certs: bool,
    transfer: TransferConfig,
    job_poll_interval: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    xml_api: Option<Arc<dyn Connector<dyn XmlApi>>>,
    wsman: Option<Arc<dyn Connector<dyn WsmanClient>>>,
    ipmi: Option<Arc<dyn Connector<dyn IpmiSession>>>,
    codec: Option<Arc<dyn Compressor>>,
}

impl fmt::Debug for ClientPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPoolBuilder")
            .field("timeout", &self.timeout)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("transfer", &self.transfer)
            .field("job_poll_interval", &self.job_poll_interval)
            .finish_non_exhaustive()
    }
}

impl ClientPoolBuilder {
    /// Prevents the HTTP client from accepting self signed certificates
    /// and other invalid certificates.
    ///
    /// By default self signed certificates will be accepted, since BMCs usually
    /// use those.
    pub fn reject_invalid_certs(mut self) -> ClientPoolBuilder {
        self.accept_invalid_certs = false;
        self
    }

    /// Overwrites the timeout that will be applied to every HTTP request
    pub fn timeout(mut self, timeout: Duration) -> ClientPoolBuilder {
        self.timeout = timeout;
        self
    }

    /// Chunk size and retry bounds for the IMM file transfer
    pub fn transfer(mut self, transfer: TransferConfig) -> ClientPoolBuilder {
        self.transfer = transfer;
        self
    }

    /// How long to wait between polls of outstanding configuration jobs
    pub fn job_poll_interval(mut self, interval: Duration) -> ClientPoolBuilder {
        self.job_poll_interval = interval;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> ClientPoolBuilder {
        self.clock = clock;
        self
    }

    /// Token checked before every round trip and every sleep
    pub fn cancellation(mut self, cancel: CancellationToken) -> ClientPoolBuilder {
        self.cancel = cancel;
        self
    }

    /// Replaces the built-in HTTPS transport for the Cisco XML API
    pub fn xml_api(mut self, connector: Arc<dyn Connector<dyn XmlApi>>) -> ClientPoolBuilder {
        self.xml_api = Some(connector);
        self
    }

    /// Required for Dell controllers
    pub fn wsman(mut self, connector: Arc<dyn Connector<dyn WsmanClient>>) -> ClientPoolBuilder {
        self.wsman = Some(connector);
        self
    }

    /// Required for IBM controllers, together with `codec`
    pub fn ipmi(mut self, connector: Arc<dyn Connector<dyn IpmiSession>>) -> ClientPoolBuilder {
        self.ipmi = Some(connector);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Compressor>) -> ClientPoolBuilder {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<ClientPool, FirmwareError> {
        let xml_api = match self.xml_api {
            Some(c) => c,
            None => {
                let http_client = HttpClientBuilder::new()
                    .danger_accept_invalid_certs(self.accept_invalid_certs)
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| FirmwareError::TransportError {
                        operation: "build HTTP client".to_string(),
                        message: e.to_string(),
                    })?;
                http_connector(http_client)
            }
        };
        Ok(ClientPool {
            transfer: self.transfer,
            job_poll_interval: self.job_poll_interval,
            pacer: Pacer::new(self.clock, self.cancel),
            xml_api,
            wsman: self.wsman,
            ipmi: self.ipmi,
            codec: self.codec,
        })
    }
}

fn http_connector(http_client: HttpClient) -> Arc<dyn Connector<dyn XmlApi>> {
    Arc::new(
        move |endpoint: &Endpoint| -> Result<Box<dyn XmlApi>, FirmwareError> {
            Ok(Box::new(HttpXmlApi::new(http_client.clone(), endpoint.clone())))
        },
    )
}

/// Shared configuration and collaborators from which per-controller
/// clients are created.
#[derive(Clone)]
pub struct ClientPool {
    transfer: TransferConfig,
    job_poll_interval: Duration,
    pacer: Pacer,
    xml_api: Arc<dyn Connector<dyn XmlApi>>,
    wsman: Option<Arc<dyn Connector<dyn WsmanClient>>>,
    ipmi: Option<Arc<dyn Connector<dyn IpmiSession>>>,
    codec: Option<Arc<dyn Compressor>>,
}

impl ClientPool {
    /// Returns Builder for configuring a client pool
    pub fn builder() -> ClientPoolBuilder {
        ClientPoolBuilder {
            timeout: DEFAULT_TIMEOUT,
            // BMCs often have a self-signed cert, so usually this has to be true
            accept_invalid_certs: true,
            transfer: TransferConfig::default(),
            job_poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            xml_api: None,
            wsman: None,
            ipmi: None,
            codec: None,
        }
    }

    /// Creates a client for the named vendor. Unknown vendor names give
    /// `Ok(None)`.
    pub fn create(
        &self,
        vendor: &str,
        endpoint: Endpoint,
    ) -> Result<Option<Box<dyn FirmwareConfig>>, FirmwareError> {
        match Vendor::from_name(vendor) {
            Some(v) => self.create_client(v, endpoint).map(Some),
            None => {
                debug!("No adapter for vendor '{vendor}'");
                Ok(None)
            }
        }
    }

    pub fn create_client(
        &self,
        vendor: Vendor,
        endpoint: Endpoint,
    ) -> Result<Box<dyn FirmwareConfig>, FirmwareError> {
        match vendor {
            Vendor::Cisco => {
                let api = self.xml_api.connect(&endpoint)?;
                Ok(Box::new(cisco::Bmc::new(endpoint, api, self.pacer.clone())))
            }
            Vendor::Dell => {
                let connector = self
                    .wsman
                    .as_ref()
                    .ok_or(FirmwareError::MissingConnector("WS-Management"))?;
                let client = connector.connect(&endpoint)?;
                Ok(Box::new(dell::Bmc::new(
                    client,
                    self.pacer.clone(),
                    self.job_poll_interval,
                )))
            }
            Vendor::Ibm => {
                let connector = self
                    .ipmi
                    .clone()
                    .ok_or(FirmwareError::MissingConnector("IPMI"))?;
                let codec = self
                    .codec
                    .clone()
                    .ok_or(FirmwareError::MissingConnector("compression codec"))?;
                Ok(Box::new(ibm::Bmc::new(
                    endpoint,
                    connector,
                    codec,
                    self.transfer.clone(),
                    self.pacer.clone(),
                )))
            }
        }
    }
}

/// XML API over HTTPS, one POST per document.
pub struct HttpXmlApi {
    endpoint: Endpoint,
    http_client: HttpClient,
}

impl HttpXmlApi {
    pub fn new(http_client: HttpClient, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            http_client,
        }
    }

    fn url(&self) -> String {
        match self.endpoint.port {
            Some(p) => format!("https://{}:{}/{}", self.endpoint.host, p, XML_API_ENDPOINT),
            None => format!("https://{}/{}", self.endpoint.host, XML_API_ENDPOINT),
        }
    }
}

impl XmlApi for HttpXmlApi {
    fn request(&self, document: &Element) -> Result<Element, FirmwareError> {
        let url = self.url();
        let body = xml::to_bytes(document, &document.name)?;
        if document.name == "aaaLogin" {
            // Credentials travel in the body
            debug!("TX POST {url} <aaaLogin>");
        } else {
            debug!("TX POST {url} {}", String::from_utf8_lossy(&body));
        }

        let response = self
            .http_client
            .post(&url)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .body(body)
            .send()
            .map_err(|e| FirmwareError::NetworkError {
                url: url.clone(),
                source: e,
            })?;
        let status_code = response.status();
        // read the body even if not status 2XX, the controller explains itself in XML
        let response_body = response.bytes().map_err(|e| FirmwareError::NetworkError {
            url: url.clone(),
            source: e,
        })?;
        debug!("RX {status_code} {}", String::from_utf8_lossy(&response_body));

        if !status_code.is_success() {
            return Err(FirmwareError::HTTPErrorCode { url, status_code });
        }
        if response_body.is_empty() {
            return Err(FirmwareError::HTTPErrorCode {
                url,
                status_code: StatusCode::NO_CONTENT,
            });
        }
        xml::parse(&response_body, &document.name)
    }
}
