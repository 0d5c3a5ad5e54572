use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use imagegen_gateway::gateway::GatewayConfig;
use imagegen_gateway::{
    Env, GenerationOutcome, GenerationProvider, GenerationRequest, GenerationService,
    ImagegenError, OptionMap, ParamList, ProviderConfig, ProviderRegistry,
};

struct Fixed {
    config: ProviderConfig,
}

impl Fixed {
    fn new(name: &str) -> Self {
        Self {
            config: ProviderConfig {
                name: name.to_string(),
                label: name.to_uppercase(),
                description: String::new(),
                is_synchronous: true,
                params: ParamList::new(),
            },
        }
    }
}

#[async_trait]
impl GenerationProvider for Fixed {
    fn provider_type(&self) -> &str {
        &self.config.name
    }

    fn describe(&self) -> &ProviderConfig {
        &self.config
    }

    fn validate(&self, _options: &OptionMap) -> imagegen_gateway::Result<()> {
        Ok(())
    }

    async fn generate(&self, _request: GenerationRequest) -> GenerationOutcome {
        GenerationOutcome::Completed {
            image_base64: "aGVsbG8=".to_string(),
            format: "png".to_string(),
        }
    }
}

#[tokio::test]
async fn custom_backends_plug_in_without_touching_the_service() -> imagegen_gateway::Result<()> {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let registry = ProviderRegistry::new().with("fixed", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Fixed::new("fixed")) as Arc<dyn GenerationProvider>)
    });
    let service = GenerationService::new(Arc::new(registry), "fixed");

    for _ in 0..3 {
        let outcome = service
            .generate(imagegen_gateway::GenerationInput {
                prompt: "a red fox".to_string(),
                ..Default::default()
            })
            .await?;
        assert!(matches!(outcome, GenerationOutcome::Completed { .. }));
    }
    assert_eq!(built.load(Ordering::SeqCst), 1);

    let view = service.providers().await;
    assert_eq!(view.providers.len(), 1);
    assert_eq!(view.providers[0].label, "FIXED");
    Ok(())
}

#[cfg(all(feature = "provider-flux", feature = "provider-gemini"))]
#[tokio::test]
async fn builtin_registry_constructs_configured_backends_only() -> imagegen_gateway::Result<()> {
    let config = GatewayConfig::from_toml_str(
        r#"
        [providers.gemini-image]
        api_key_env = ["IMAGEGEN_CONTRACT_UNSET_GEMINI_KEY"]
        "#,
    )?;
    let env = Env::parse_dotenv("BFL_API_KEY=bfl-contract\n");
    let registry = ProviderRegistry::builtin(&config, &env);

    assert_eq!(
        registry.provider_types().collect::<Vec<_>>(),
        ["flux-kontext-pro", "flux-kontext-max", "gemini-image"]
    );

    let pro = registry.resolve("flux-kontext-pro").await?;
    assert_eq!(pro.provider_type(), "flux-kontext-pro");
    assert!(!pro.describe().is_synchronous);

    let err = match registry.resolve("gemini-image").await {
        Ok(_) => panic!("gemini-image should need a credential"),
        Err(err) => err,
    };
    assert!(err.is_configuration());
    assert!(err.to_string().contains("IMAGEGEN_CONTRACT_UNSET_GEMINI_KEY"));

    let listed: Vec<String> = registry
        .list_all()
        .await
        .into_iter()
        .map(|config| config.name)
        .collect();
    assert_eq!(listed, ["flux-kontext-pro", "flux-kontext-max"]);

    assert!(matches!(
        registry.resolve("midjourney").await,
        Err(ImagegenError::UnsupportedProvider(_))
    ));
    Ok(())
}
