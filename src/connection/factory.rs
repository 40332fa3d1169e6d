use super::*;

/// Parameters handed to a transport constructor.
pub type ConnectionParams = serde_json::Map<String, serde_json::Value>;

/// Builds a fresh transport from parameters.
pub type Constructor =
    Arc<dyn Fn(ConnectionParams) -> Result<Box<dyn Transport>, ConnectError> + Send + Sync>;

/// Global registry preloaded with the built-in transports.
pub static REGISTRY: Lazy<ConnectionRegistry> = Lazy::new(ConnectionRegistry::with_builtins);

/// Maps `(io_type, variant)` pairs to transport constructors.
///
/// Every lookup invokes the constructor again, so callers always receive a
/// distinct transport. Registering a pair that already exists replaces the
/// previous constructor.
#[derive(Default)]
pub struct ConnectionFactory {
    constructors: RwLock<HashMap<(String, String), Constructor>>,
}

impl ConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, io_type: impl Into<String>, variant: impl Into<String>, constructor: F)
    where
        F: Fn(ConnectionParams) -> Result<Box<dyn Transport>, ConnectError> + Send + Sync + 'static,
    {
        let key = (io_type.into(), variant.into());
        debug!("registering constructor for [({}, {})] connection", key.0, key.1);
        let mut guard = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.insert(key.clone(), Arc::new(constructor)).is_some() {
            debug!("constructor for [({}, {})] connection replaced", key.0, key.1);
        }
    }

    /// Constructs a transport for the pair.
    ///
    /// # Errors
    ///
    /// [`ConnectError::NoConstructorRegistered`] naming the pair when nothing
    /// is registered for it, or whatever the constructor itself returns.
    pub fn get(
        &self,
        io_type: &str,
        variant: &str,
        params: ConnectionParams,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(io_type.to_string(), variant.to_string()))
            .cloned()
            .ok_or_else(|| ConnectError::NoConstructorRegistered {
                io_type: io_type.to_string(),
                variant: variant.to_string(),
            })?;
        constructor(params)
    }

    /// Variants registered for `io_type`, sorted.
    pub fn available_variants(&self, io_type: &str) -> Vec<String> {
        let guard = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut variants: Vec<String> = guard
            .keys()
            .filter(|(registered, _)| registered == io_type)
            .map(|(_, variant)| variant.clone())
            .collect();
        variants.sort();
        variants
    }

    pub fn clear(&self) {
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = guard.keys().collect();
        keys.sort();
        f.debug_struct("ConnectionFactory")
            .field("registered", &keys)
            .finish()
    }
}

/// What a caller asks the registry for.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionRequest {
    /// A connection declared in configuration.
    Named {
        name: String,
        variant: Option<String>,
    },
    /// A connection of the given type built from explicit parameters.
    Typed {
        io_type: String,
        variant: Option<String>,
        params: ConnectionParams,
    },
}

impl ConnectionRequest {
    pub fn named(name: impl Into<String>) -> Self {
        ConnectionRequest::Named {
            name: name.into(),
            variant: None,
        }
    }

    pub fn typed(io_type: impl Into<String>) -> Self {
        ConnectionRequest::Typed {
            io_type: io_type.into(),
            variant: None,
            params: ConnectionParams::new(),
        }
    }

    pub fn with_variant(mut self, selected: impl Into<String>) -> Self {
        match &mut self {
            ConnectionRequest::Named { variant, .. } | ConnectionRequest::Typed { variant, .. } => {
                *variant = Some(selected.into());
            }
        }
        self
    }

    /// Adds a constructor parameter. Ignored for named requests, whose
    /// parameters come from configuration.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let ConnectionRequest::Typed { params, .. } = &mut self {
            params.insert(key.into(), value.into());
        }
        self
    }
}

/// Factory plus configuration: resolves names and default variants before
/// delegating construction to the [`ConnectionFactory`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    factory: ConnectionFactory,
    config: RwLock<ConnectionsConfig>,
}

impl ConnectionRegistry {
    /// Empty registry: no constructors, no configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `memory`, `tcp` and `ssh` transports.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        transport::register_builtin_transports(&registry.factory);
        registry
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// Merges `config` into the current configuration.
    pub fn load_config(&self, config: ConnectionsConfig) {
        debug!(
            "loading {} named connection(s), {} default variant(s)",
            config.named_connections.len(),
            config.default_variants.len()
        );
        self.config_mut().merge(config);
    }

    pub fn load_config_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConnectError> {
        self.load_config(ConnectionsConfig::from_path(path)?);
        Ok(())
    }

    pub fn define_connection(&self, name: impl Into<String>, connection: NamedConnection) {
        self.config_mut()
            .named_connections
            .insert(name.into(), connection);
    }

    pub fn set_default_variant(&self, io_type: impl Into<String>, variant: impl Into<String>) {
        self.config_mut()
            .default_variants
            .insert(io_type.into(), variant.into());
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ConnectionsConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forgets configuration. Registered constructors are kept.
    pub fn clear(&self) {
        *self.config_mut() = ConnectionsConfig::default();
    }

    /// Builds a transport for `request`.
    ///
    /// Named requests are resolved through configuration and receive the name
    /// as their `name` parameter. A missing variant falls back to the
    /// configured default variant of the io type.
    pub fn get_connection(&self, request: ConnectionRequest) -> Result<Box<dyn Transport>, ConnectError> {
        let (io_type, variant, params) = match request {
            ConnectionRequest::Named { name, variant } => {
                let named = self
                    .config
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .named_connections
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ConnectError::UnknownNamedConnection(name.clone()))?;
                let mut params = named.params;
                params.insert("name".to_string(), serde_json::Value::String(name));
                (named.io_type, variant, params)
            }
            ConnectionRequest::Typed {
                io_type,
                variant,
                params,
            } => (io_type, variant, params),
        };

        let variant = self.select_variant(&io_type, variant)?;
        debug!("constructing [({io_type}, {variant})] connection");
        self.factory.get(&io_type, &variant, params)
    }

    fn select_variant(&self, io_type: &str, variant: Option<String>) -> Result<String, ConnectError> {
        let variant = match variant {
            Some(variant) => variant,
            None => self
                .config
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .default_variants
                .get(io_type)
                .cloned()
                .ok_or_else(|| ConnectError::NoVariantSelected(io_type.to_string()))?,
        };
        if !self.factory.available_variants(io_type).contains(&variant) {
            return Err(ConnectError::VariantNotRegistered {
                io_type: io_type.to_string(),
                variant,
            });
        }
        Ok(variant)
    }

    fn config_mut(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionsConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds a transport through the global [`REGISTRY`].
pub fn get_connection(request: ConnectionRequest) -> Result<Box<dyn Transport>, ConnectError> {
    REGISTRY.get_connection(request)
}
