use crate::admission::{resolve_client_ip, AdmissionGate};
use crate::audit::AuditLog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::render::RendererRegistry;
use crate::servers::{GeoResolver, StaticGeoResolver, YamlServerStore};
use crate::store::Store;
use crate::subscription::{SubscribeQuery, SubscriptionAssembler};
use crate::types::AuditEntry;
use crate::users::YamlUserStore;
use crate::utils::{current_timestamp, format_datetime};
use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const SUBSCRIBE_PATH: &str = "/api/v1/client/subscribe";
const RECENT_REQUESTS_PATH: &str = "/api/v1/client/subscription/recent-requests";
const ACTIVE_USERS_PATH: &str = "/api/v1/client/subscription/active-users";

pub struct Server {
    config: Arc<Config>,
    store: Arc<Store>,
    gate: Arc<AdmissionGate>,
    audit: Arc<AuditLog>,
    assembler: Arc<SubscriptionAssembler>,
    metrics: Arc<MetricsCollector>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(Store::new(&config.storage.path)?);

        let users = Arc::new(YamlUserStore::from_file(&config.data.users_file)?);
        info!(users = users.len(), "user snapshot loaded");
        let servers = Arc::new(YamlServerStore::from_file(&config.data.servers_file)?);

        let geo: Arc<dyn GeoResolver> = match &config.data.geo_file {
            Some(path) => Arc::new(StaticGeoResolver::from_file(path)?),
            None => Arc::new(StaticGeoResolver::empty()),
        };

        let metrics = Arc::new(
            MetricsCollector::new().map_err(|e| Error::Internal(e.to_string()))?,
        );

        let gate = Arc::new(AdmissionGate::new(
            store.clone(),
            users.clone(),
            config.admission.clone(),
        ));
        let audit = Arc::new(AuditLog::new(store.clone()));

        let registry = Arc::new(RendererRegistry::new());
        let assembler = Arc::new(SubscriptionAssembler::new(
            users,
            servers,
            geo,
            registry,
            config.subscription.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            gate,
            audit,
            assembler,
            metrics,
        })
    }

    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address: {}", e)))?;

        info!("Starting subscription gateway on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        let server = Arc::new(self);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = server.clone();
                            let io = TokioIo::new(stream);

                            tokio::spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let server = server.clone();
                                    async move { server.handle_connection(req, peer_addr).await }
                                });

                                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    error!("Error serving connection: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received, gracefully shutting down...");
                    break;
                }
            }
        }

        server.store.flush()?;
        Ok(())
    }

    async fn handle_connection(
        &self,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let path = req.uri().path();

        let response = match (req.method(), path) {
            (&http::Method::GET, SUBSCRIBE_PATH) => self.handle_subscribe(&req, peer_addr),
            (&http::Method::GET, RECENT_REQUESTS_PATH) => {
                self.handle_recent_requests(&req, peer_addr)
            }
            (&http::Method::GET, ACTIVE_USERS_PATH) => self.handle_active_users(&req, peer_addr),
            (&http::Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
            (&http::Method::GET, p)
                if self.config.monitoring.prometheus.enabled
                    && p == self.config.monitoring.prometheus.path =>
            {
                self.handle_metrics()
            }
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        };

        Ok(response)
    }

    fn handle_subscribe(
        &self,
        req: &Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let query = parse_query(req.uri());
        let user_agent = header_value(req, "user-agent");
        let ip = resolve_client_ip(query.ip.as_deref(), req.headers(), peer_addr);

        let user = match self
            .gate
            .authorize(&ip, query.token.as_deref(), true, req.headers())
        {
            Ok(user) => user,
            Err(e) => return self.reject(&ip, e),
        };

        self.metrics.record_subscribe();

        let ts = current_timestamp();
        let recorded = self.audit.record(&AuditEntry {
            ip: ip.clone(),
            user_id: user.id,
            email: user.email.clone(),
            timestamp: ts,
            datetime: format_datetime(ts),
            user_agent: user_agent.clone(),
        });
        if !recorded {
            self.metrics.record_audit_failure();
        }

        match self.assembler.assemble(&user, &query, &ip, &user_agent) {
            Ok(Some(rendered)) => {
                self.metrics.record_render(rendered.renderer);
                text_response(StatusCode::OK, &rendered.body)
            }
            // Unavailable account: empty body, not an error status
            Ok(None) => text_response(StatusCode::OK, ""),
            Err(e) => {
                error!(user_id = user.id, "Failed to assemble subscription: {}", e);
                text_response(e.status(), "Internal Server Error")
            }
        }
    }

    fn handle_recent_requests(
        &self,
        req: &Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let query = parse_query(req.uri());
        let ip = resolve_client_ip(query.ip.as_deref(), req.headers(), peer_addr);

        let user = match self
            .gate
            .authorize(&ip, query.token.as_deref(), false, req.headers())
        {
            Ok(user) => user,
            Err(e) => return self.reject(&ip, e),
        };

        let target_user_id = query
            .user_id
            .as_deref()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(user.id);

        match self.audit.recent_requests(target_user_id) {
            Ok(entries) => {
                let rows: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "ip": e.ip,
                            "datetime": e.datetime,
                            "user_agent": e.user_agent,
                        })
                    })
                    .collect();
                json_response(
                    StatusCode::OK,
                    serde_json::json!({
                        "success": true,
                        "data": {
                            "user_id": target_user_id,
                            "total_requests": rows.len(),
                            "recent_requests": rows,
                        }
                    }),
                )
            }
            Err(e) => {
                error!("Failed to read recent requests: {}", e);
                text_response(e.status(), "Internal Server Error")
            }
        }
    }

    fn handle_active_users(
        &self,
        req: &Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let query = parse_query(req.uri());
        let ip = resolve_client_ip(query.ip.as_deref(), req.headers(), peer_addr);

        if let Err(e) = self
            .gate
            .authorize(&ip, query.token.as_deref(), false, req.headers())
        {
            return self.reject(&ip, e);
        }

        match self.audit.active_users(current_timestamp()) {
            Ok(active) => json_response(
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "data": { "active_users": active }
                }),
            ),
            Err(e) => {
                error!("Failed to read active users: {}", e);
                text_response(e.status(), "Internal Server Error")
            }
        }
    }

    fn handle_metrics(&self) -> Response<Full<Bytes>> {
        match self.metrics.render_metrics() {
            Ok(body) => text_response(StatusCode::OK, &body),
            Err(e) => {
                error!("Failed to render metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    fn reject(&self, ip: &str, err: Error) -> Response<Full<Bytes>> {
        self.metrics.record_rejection(rejection_reason(&err));
        warn!(ip, "request rejected: {}", err);
        text_response(err.status(), &err.to_string())
    }
}

fn rejection_reason(err: &Error) -> &'static str {
    match err {
        Error::Blocked(_) => "blocked",
        Error::InvalidToken(_) => "invalid_token",
        Error::RateLimitedUser(_) => "rate_limited_user",
        Error::RateLimitedIp(_) => "rate_limited_ip",
        Error::Store(_) => "store",
        _ => "other",
    }
}

fn header_value(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn parse_query(uri: &Uri) -> SubscribeQuery {
    let mut query = SubscribeQuery::default();
    let raw = uri.query().unwrap_or_default();

    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "token" => query.token = Some(value),
            "types" => query.types = Some(value),
            "ss2022" => query.ss2022 = Some(value),
            "filter" => query.filter = Some(value),
            "flag" => query.flag = Some(value),
            "ip" => query.ip = Some(value),
            "inbound" => query.inbound = Some(value),
            "user_id" => query.user_id = Some(value),
            _ => {}
        }
    }

    query
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
