use crate::{
    core::{Authenticator, Authorizer, CredentialCache},
    http::{Collaborators, Gateway, HttpMetrics, Login},
    index::{self, Informers, RbacIndex},
    k8s::{self, watcher},
    server, KubeCluster, ServiceAccountIssuer, TokenReviewer,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, time::Duration};
use tracing::{error, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "kube-gateway", about = "A Kubernetes API gateway")]
pub struct Args {
    #[clap(
        long,
        default_value = "kube_gateway=info,warn",
        env = "KUBE_GATEWAY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8001")]
    http_addr: SocketAddr,

    /// The namespace in which login creates ServiceAccounts.
    #[clap(long, default_value = "default")]
    login_namespace: String,

    #[clap(long, default_value = "admin", env = "KUBE_GATEWAY_LOGIN_USER")]
    login_user: String,

    #[clap(long, env = "KUBE_GATEWAY_LOGIN_PASSWORD", hide_env_values = true)]
    login_password: String,

    /// The lifetime of tokens minted by login.
    #[clap(long, default_value = "3600")]
    token_expiration_secs: i64,

    /// How long a watch stream waits for a wake-up before checking again.
    #[clap(long, default_value = "1000")]
    watch_idle_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            http_addr,
            login_namespace,
            login_user,
            login_password,
            token_expiration_secs,
            watch_idle_ms,
        } = self;

        if token_expiration_secs <= 0 {
            bail!("--token-expiration-secs must be positive");
        }

        let mut prom = <Registry>::default();
        let http_metrics = HttpMetrics::register(prom.sub_registry_with_prefix("http"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the RBAC index that backs authorization. Until the watches
        // sync, every request is denied.
        let rbac = index::rbac::Index::shared();

        let role_bindings = runtime.watch_all::<k8s::RoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac.clone(), role_bindings)
                .instrument(info_span!("rolebindings")),
        );

        let roles = runtime.watch_all::<k8s::Role>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(rbac.clone(), roles).instrument(info_span!("roles")));

        let cluster_role_bindings =
            runtime.watch_all::<k8s::ClusterRoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac.clone(), cluster_role_bindings)
                .instrument(info_span!("clusterrolebindings")),
        );

        let cluster_roles = runtime.watch_all::<k8s::ClusterRole>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac.clone(), cluster_roles)
                .instrument(info_span!("clusterroles")),
        );

        let client = runtime.client();
        let collaborators = Collaborators {
            authn: Authenticator::new(
                Arc::new(CredentialCache::default()),
                Arc::new(TokenReviewer::new(client.clone())),
            ),
            authz: Authorizer::new(Arc::new(RbacIndex::new(rbac))),
            client: Arc::new(KubeCluster::new(client.clone())),
            subscriptions: Arc::new(Informers::new(client.clone())),
            issuer: Arc::new(ServiceAccountIssuer::new(
                client,
                login_namespace.clone(),
                token_expiration_secs,
            )),
        };
        let login = Login {
            namespace: login_namespace,
            user: login_user,
            password: login_password,
        };
        let gateway = Gateway::new(collaborators, login, runtime.shutdown_handle())
            .with_watch_idle(Duration::from_millis(watch_idle_ms))
            .with_metrics(http_metrics);

        // Run the gateway's HTTP server until shutdown.
        let listener = TcpListener::bind(http_addr).await?;
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = server::serve(http_addr, listener, gateway, drain).await {
                error!(%error, "HTTP server failed");
            }
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
