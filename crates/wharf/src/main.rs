use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use wharf_backend_postgres::{reclaim_orphans, PgRepositoryManager};
use wharf_core::media_types::MediaTypeRegistry;
use wharf_core::registry::{
    ContentRef, ManifestRef, Remote, RepositoryStoreManager,
};
use wharf_http::{Authorizer, Wharf, WharfOptions};
use wharf_sync::{ManifestSigner, PullThroughCache, SyncJob};
use wharf_tasks::{ResourceKey, TaskRuntime};
use wharf_token::{TokenIssuer, TokenService, TokenVerifier};

mod config;
use crate::config::{Config, RepositoryBackend};

#[derive(Parser)]
#[command(name = "wharf", about = "content-addressed container registry")]
struct Cli {
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry (the default).
    Serve,
    /// Run one synchronization of a sync repository against a configured
    /// remote.
    Sync {
        #[arg(long)]
        repository: String,
        #[arg(long)]
        remote: String,
        #[arg(long)]
        mirror: bool,
    },
    /// Sign a manifest with the configured external signer.
    Sign {
        #[arg(long)]
        repository: String,
        #[arg(long)]
        reference: String,
    },
    /// Delete content no repository version references.
    Reclaim,
}

struct App {
    config: Config,
    manager: PgRepositoryManager,
    runtime: TaskRuntime,
    remotes_by_name: HashMap<String, Remote>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .compact()
        .init();

    // load configuration
    let mut config_file = File::open(cli.config_file.unwrap_or("./dev-config.yml".into()))?;
    let mut s = String::new();
    config_file.read_to_string(&mut s)?;
    let config: Config = serde_yaml::from_str(&s)?;

    let app = App::initialize(config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => app.serve().await,
        Command::Sync {
            repository,
            remote,
            mirror,
        } => app.run_sync(&repository, &remote, mirror).await,
        Command::Sign {
            repository,
            reference,
        } => app.run_sign(&repository, &reference).await,
        Command::Reclaim => app.run_reclaim().await,
    }
}

impl App {
    async fn initialize(config: Config) -> Result<Self> {
        let media_types = Arc::new(MediaTypeRegistry::new(
            config.registry.additional_oci_artifact_types.clone(),
            config.registry.manifest_spec,
            config.registry.oci_payload_max_bytes,
        ));

        // initialize persistence layer
        let manager = match &config.backend {
            RepositoryBackend::Postgres(cfg) => cfg.get_manager(media_types.clone()).await?,
        };

        let runtime = TaskRuntime::new();

        // configure static repositories
        if let Some(repositories) = &config.static_repositories {
            for definition in repositories {
                if manager.get(&definition.name).await?.is_none() {
                    tracing::info!(
                        "static repository '{}' not found, inserting into DB",
                        definition.name,
                    );
                    manager.create(&definition.name, definition.kind).await?;
                }
            }
        }

        // configure remotes and distributions
        let mut remotes_by_name = HashMap::new();
        for definition in &config.remotes {
            let remote = Remote {
                id: Uuid::new_v4(),
                name: definition.name.clone(),
                url: definition.url.clone(),
                upstream_name: definition.upstream_name.clone(),
                username: definition.username.clone(),
                password: definition.password.clone(),
                sigstore: definition.sigstore.clone(),
                include_tags: definition.include_tags.clone(),
                exclude_tags: definition.exclude_tags.clone(),
                policy: definition.policy,
                max_retries: definition.max_retries,
                rate_limit: definition.rate_limit,
            };
            let id = manager.upsert_remote(&remote).await?;
            remotes_by_name.insert(definition.name.clone(), Remote { id, ..remote });
        }
        for definition in &config.distributions {
            let remote_id = match &definition.remote {
                Some(name) => Some(
                    remotes_by_name
                        .get(name)
                        .with_context(|| format!("distribution references unknown remote {name}"))?
                        .id,
                ),
                None => None,
            };
            manager
                .upsert_distribution(
                    &definition.base_path,
                    &definition.repository,
                    definition.version,
                    definition.private,
                    remote_id,
                )
                .await?;
        }

        if config.registry.flatpak_index_enabled {
            tracing::warn!(
                "flatpak_index_enabled is set; the index front end is served separately",
            );
        }

        Ok(Self {
            config,
            manager,
            runtime,
            remotes_by_name,
        })
    }

    fn authorizer(&self) -> Result<(Authorizer, Option<TokenService>)> {
        let registry = &self.config.registry;
        let policy = Arc::new(registry.policy.clone());

        if registry.token.disabled {
            let authorizer = Authorizer {
                verifier: None,
                policy,
                realm: registry.token.server_url.clone(),
                service: registry.service.clone(),
            };
            return Ok((authorizer, None));
        }

        let public_key_path = registry
            .token
            .public_key_path
            .as_ref()
            .context("token auth enabled but public_key_path unset")?;
        let private_key_path = registry
            .token
            .private_key_path
            .as_ref()
            .context("token auth enabled but private_key_path unset")?;
        let public_pem = std::fs::read(public_key_path)
            .with_context(|| format!("reading {}", public_key_path.display()))?;
        let private_pem = std::fs::read(private_key_path)
            .with_context(|| format!("reading {}", private_key_path.display()))?;

        let issuer = Arc::new(TokenIssuer::from_pem(
            registry.token.signature_algorithm,
            &private_pem,
            registry.service.clone(),
            registry.token.expiration_seconds,
            registry.token.kid.clone(),
        )?);
        let verifier = Arc::new(TokenVerifier::from_pem(
            registry.token.signature_algorithm,
            &public_pem,
            registry.service.clone(),
        )?);

        let authorizer = Authorizer {
            verifier: Some(verifier),
            policy: policy.clone(),
            realm: registry.token.server_url.clone(),
            service: registry.service.clone(),
        };
        let token_service = TokenService::new(issuer, policy);
        Ok((authorizer, Some(token_service)))
    }

    async fn serve(self) -> Result<()> {
        let (authorizer, token_service) = self.authorizer()?;

        let manager: Arc<dyn RepositoryStoreManager> = Arc::new(self.manager.clone());
        let fetcher = Arc::new(PullThroughCache::new(manager.clone(), self.runtime.clone()));

        let wharf = Wharf::new(
            manager,
            self.runtime.clone(),
            WharfOptions {
                authorizer,
                fetcher: Some(fetcher),
                cache_enabled: self.config.registry.cache_enabled,
            },
        );

        let mut router = wharf.router()?;
        if let Some(token_service) = token_service {
            router = router.merge(token_service.router());
        }

        if let Some(interval) = self.config.registry.reclaim_interval_seconds {
            let metadata = self.manager.metadata().clone();
            let objects = self.manager.objects().clone();
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let metadata = metadata.clone();
                    let objects = objects.clone();
                    let handle = runtime.spawn(
                        "reclaim",
                        vec![ResourceKey::content()],
                        move |_ctx| async move {
                            reclaim_orphans(&metadata, &objects)
                                .await
                                .map(|_| ())
                                .map_err(|e| format!("{e}"))
                        },
                    );
                    if let Err(e) = handle.wait().await {
                        tracing::warn!("periodic reclaim failed: {e}");
                    }
                }
            });
        }

        // run HTTP server
        let addr = std::net::SocketAddr::from_str(&self.config.listen)?;
        tracing::info!("serving the distribution API on {addr}");
        axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .await?;

        Ok(())
    }

    async fn run_sync(self, repository: &str, remote: &str, mirror: bool) -> Result<()> {
        let remote = self
            .remotes_by_name
            .get(remote)
            .with_context(|| format!("unknown remote {remote}"))?
            .clone();
        let store = match self.manager.get(repository).await? {
            Some(store) => store,
            None => {
                self.manager
                    .create(repository, wharf_core::registry::RepositoryKind::Sync)
                    .await?
            }
        };

        let job = SyncJob {
            repository: store,
            remote,
            mode: if mirror {
                wharf_core::registry::SyncMode::Mirror
            } else {
                wharf_core::registry::SyncMode::Additive
            },
            runtime: self.runtime.clone(),
        };
        let outcome = job.run().await?;
        tracing::info!(
            version = outcome.version,
            synced = outcome.tags_synced.len(),
            removed = outcome.tags_removed.len(),
            "sync finished",
        );
        Ok(())
    }

    async fn run_sign(self, repository: &str, reference: &str) -> Result<()> {
        let Some(script) = &self.config.registry.signer_script else {
            bail!("no signer_script configured");
        };
        let signer = ManifestSigner::new(
            script.clone(),
            self.config.registry.max_parallel_signing_tasks,
        );

        let store = self
            .manager
            .get(repository)
            .await?
            .with_context(|| format!("unknown repository {repository}"))?;
        let manifest_ref = ManifestRef::from_str(reference)?;
        let record = store
            .manifest_store()
            .head(None, &manifest_ref)
            .await?
            .with_context(|| format!("unknown manifest {reference}"))?;

        let signature = signer
            .sign(
                &store,
                &record.digest,
                reference,
                self.config.registry.signing_key_id.clone(),
            )
            .await?;

        let version_store = store.version_store();
        let signature_id = signature.id;
        self.runtime
            .run_exclusive(vec![ResourceKey::repository(store.name())], async move {
                version_store
                    .recursive_add(&[ContentRef::Signature { id: signature_id }])
                    .await
            })
            .await?;

        tracing::info!(name = signature.name, "manifest signed");
        Ok(())
    }

    async fn run_reclaim(self) -> Result<()> {
        let metadata = self.manager.metadata().clone();
        let objects = self.manager.objects().clone();
        let handle = self.runtime.spawn(
            "reclaim",
            vec![ResourceKey::content()],
            move |_ctx| async move {
                reclaim_orphans(&metadata, &objects)
                    .await
                    .map(|_| ())
                    .map_err(|e| format!("{e}"))
            },
        );
        handle.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(())
    }
}
