//! The process-wide root: app registry, home planet, session launch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use orbit_proto::{AttrSchema, ErrCode, ReqErr, DEFAULT_APP_URI};
use orbit_store::DynKv;
use tokio::sync::broadcast;

use crate::app::App;
use crate::config::HostOpts;
use crate::error::{HostError, HostResult};
use crate::planet::Planet;
use crate::session::{self, SessionHandle};

/// The host's home planet, by convention.
pub const HOME_PLANET_ID: u64 = 1;

#[derive(Default)]
struct AppRegistry {
    by_uri: HashMap<String, Arc<dyn App>>,
    default_for_model: HashMap<String, Arc<dyn App>>,
}

pub struct Host {
    opts: HostOpts,
    kv: DynKv,
    home_planet: Arc<Planet>,
    apps: RwLock<AppRegistry>,
    next_session_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Host {
    /// Bring up a host over the shared KV collaborator: opens the home
    /// planet and an empty app registry.
    pub fn start(kv: DynKv, opts: HostOpts) -> HostResult<Arc<Host>> {
        let home_planet = Planet::open(HOME_PLANET_ID, kv.clone())?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Host {
            opts,
            kv,
            home_planet,
            apps: RwLock::new(AppRegistry::default()),
            next_session_id: AtomicU64::new(0),
            shutdown_tx,
        }))
    }

    pub fn opts(&self) -> &HostOpts {
        &self.opts
    }

    pub fn kv(&self) -> &DynKv {
        &self.kv
    }

    pub fn home_planet(&self) -> &Arc<Planet> {
        &self.home_planet
    }

    /// Install an app under its app URI and as the default handler for each
    /// of its data-model URIs. Duplicate app URIs fail; a taken default slot
    /// is replaced last-write-wins unless `strict_app_defaults` is set.
    pub fn register_app(&self, app: Arc<dyn App>) -> HostResult<()> {
        let uri = app.app_uri().to_string();
        let mut registry = self.apps.write().unwrap();
        if registry.by_uri.contains_key(&uri) {
            return Err(HostError::DuplicateApp(uri));
        }
        for model in app.data_model_uris() {
            if let Some(prev) = registry.default_for_model.get(&model) {
                if self.opts.strict_app_defaults {
                    return Err(HostError::DuplicateApp(format!(
                        "default slot for data model '{model}' is taken by '{}'",
                        prev.app_uri()
                    )));
                }
                tracing::warn!(
                    model = %model,
                    prev = %prev.app_uri(),
                    next = %uri,
                    "replacing default app for data model"
                );
            }
            registry.default_for_model.insert(model, app.clone());
        }
        tracing::info!(app = %uri, "app registered");
        registry.by_uri.insert(uri, app);
        Ok(())
    }

    /// Select the app serving a resolved schema: its app URI if given, the
    /// data model's default handler when the app URI is the `"."` marker.
    pub fn select_app_for_schema(
        &self,
        planet: &Planet,
        schema: &AttrSchema,
    ) -> Result<Arc<dyn App>, ReqErr> {
        let use_default = match schema.app_uri.sym() {
            Some(sym) => sym == planet.default_app_sym(),
            None => schema.app_uri.text() == Some(DEFAULT_APP_URI),
        };
        let registry = self.apps.read().unwrap();
        if use_default {
            let model = planet.uri_text(&schema.attr_model_uri)?;
            registry
                .default_for_model
                .get(&model)
                .cloned()
                .ok_or_else(|| {
                    ErrCode::AppNotFound.err(format!("no default app for data model '{model}'"))
                })
        } else {
            let uri = planet.uri_text(&schema.app_uri)?;
            registry
                .by_uri
                .get(&uri)
                .cloned()
                .ok_or_else(|| ErrCode::AppNotFound.err(format!("no app '{uri}'")))
        }
    }

    /// Launch a new session; the returned handle is the transport-facing
    /// endpoint.
    pub fn start_session(self: &Arc<Self>) -> SessionHandle {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        session::start(self.clone(), session_id)
    }

    /// Observed by the transport accept loop.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{CellReq, CellSub};
    use orbit_proto::{AttrSpec, SeriesType, Uri};
    use orbit_store::MemKv;

    #[derive(Debug)]
    struct StubApp {
        uri: &'static str,
        models: Vec<String>,
    }

    impl StubApp {
        fn new(uri: &'static str, model: &str) -> Arc<StubApp> {
            Arc::new(StubApp {
                uri,
                models: vec![model.to_string()],
            })
        }
    }

    #[async_trait::async_trait]
    impl App for StubApp {
        fn app_uri(&self) -> &str {
            self.uri
        }
        fn data_model_uris(&self) -> Vec<String> {
            self.models.clone()
        }
        async fn resolve_request(&self, _req: &mut CellReq) -> anyhow::Result<()> {
            Ok(())
        }
        async fn push_cell_state(&self, _sub: Arc<dyn CellSub>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_host(opts: HostOpts) -> Arc<Host> {
        Host::start(Arc::new(MemKv::new()), opts).unwrap()
    }

    fn resolved_schema(host: &Host, app_uri: &str, model_uri: &str) -> AttrSchema {
        let planet = host.home_planet();
        let sym = |value: &str| -> Uri {
            Uri::Sym(planet.symbol_id(value.as_bytes(), true).unwrap())
        };
        AttrSchema {
            app_uri: sym(app_uri),
            attr_model_uri: sym(model_uri),
            schema_name: sym("schema/test"),
            schema_id: 1,
            attrs: vec![AttrSpec {
                attr_uri: sym("v1/name"),
                attr_id: 7,
                series_type: SeriesType::Fixed,
                bound_si: 0,
                val_type_id: 7,
            }],
            inherits_from: Vec::new(),
        }
    }

    #[test]
    fn duplicate_app_uri_is_rejected() {
        let host = test_host(HostOpts::default());
        host.register_app(StubApp::new("test/a/v1", "model/a")).unwrap();
        let err = host
            .register_app(StubApp::new("test/a/v1", "model/b"))
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateApp(_)));
    }

    #[test]
    fn selection_by_app_uri_and_by_default_slot() {
        let host = test_host(HostOpts::default());
        host.register_app(StubApp::new("test/a/v1", "model/a")).unwrap();
        host.register_app(StubApp::new("test/b/v1", "model/b")).unwrap();
        let planet = host.home_planet();

        let schema = resolved_schema(&host, "test/b/v1", "model/a");
        let app = host.select_app_for_schema(planet, &schema).unwrap();
        assert_eq!(app.app_uri(), "test/b/v1");

        let schema = resolved_schema(&host, ".", "model/a");
        let app = host.select_app_for_schema(planet, &schema).unwrap();
        assert_eq!(app.app_uri(), "test/a/v1");
    }

    #[test]
    fn missing_app_reports_app_not_found() {
        let host = test_host(HostOpts::default());
        let planet = host.home_planet();
        let schema = resolved_schema(&host, ".", "model/none");
        let err = host.select_app_for_schema(planet, &schema).unwrap_err();
        assert_eq!(err.code, ErrCode::AppNotFound);
    }

    #[test]
    fn default_slot_is_last_write_wins_unless_strict() {
        let host = test_host(HostOpts::default());
        host.register_app(StubApp::new("test/a/v1", "model/a")).unwrap();
        host.register_app(StubApp::new("test/a2/v1", "model/a")).unwrap();
        let planet = host.home_planet();
        let schema = resolved_schema(&host, ".", "model/a");
        let app = host.select_app_for_schema(planet, &schema).unwrap();
        assert_eq!(app.app_uri(), "test/a2/v1");

        let strict = test_host(HostOpts {
            strict_app_defaults: true,
            ..HostOpts::default()
        });
        strict.register_app(StubApp::new("test/a/v1", "model/a")).unwrap();
        let err = strict
            .register_app(StubApp::new("test/a2/v1", "model/a"))
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateApp(_)));
    }

    #[test]
    fn unresolved_default_marker_still_selects_the_default_slot() {
        let host = test_host(HostOpts::default());
        host.register_app(StubApp::new("test/a/v1", "model/a")).unwrap();
        let planet = host.home_planet();
        let mut schema = resolved_schema(&host, ".", "model/a");
        schema.app_uri = Uri::from(DEFAULT_APP_URI);
        let app = host.select_app_for_schema(planet, &schema).unwrap();
        assert_eq!(app.app_uri(), "test/a/v1");
    }
}
