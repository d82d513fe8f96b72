use serde_derive::{Deserialize, Serialize};

use crate::core::ShmemConfig;
use crate::errors::{BakeryError, Result};
use crate::guard::GuardNames;

pub const CONFIG_VERSION: u32 = 1;

// Fixed capacities of the shared game-state record.
pub const MAX_INGREDIENTS: usize = 8;
pub const MAX_CATEGORIES: usize = 4;
pub const MAX_PRODUCTS: usize = 8;
pub const MAX_ORDER_ITEMS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeryConfig {
    pub version: u32,
    pub shmem: ShmemConfig,
    pub simulation: SimulationConfig,
    pub customers: CustomerConfig,
    pub sellers: SellerConfig,
    pub chefs: ChefConfig,
    pub supply: SupplyConfig,
    pub ingredients: Vec<IngredientConfig>,
    pub catalog: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Manager and orchestrator bookkeeping period.
    pub tick_ms: u64,
    /// 0 runs until interrupted.
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerConfig {
    pub max_customers: u32,
    pub customer_probability: f64,
    pub min_patience: f32,
    pub max_patience: f32,
    pub min_patience_decay: f32,
    pub max_patience_decay: f32,
    /// Ticks spent walking to the queue.
    pub walk_ticks: u32,
    /// Patience decay period.
    pub tick_ms: u64,
    pub cascade_probability: f64,
    pub cascade_window_secs: f64,
    pub complaint_probability: f64,
    pub max_order_items: u32,
    pub min_item_quantity: u32,
    pub max_item_quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SellerConfig {
    pub count: u32,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChefConfig {
    pub count: u32,
    pub low_water: i32,
    pub target_level: i32,
    pub bake_interval_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyConfig {
    /// Delivery delay at urgency 1; urgency u waits `base_delay_ms / u`.
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientConfig {
    pub name: String,
    pub initial: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub products: Vec<ProductConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductConfig {
    pub name: String,
    pub price: f32,
    pub initial: i32,
    pub recipe: Vec<RecipeItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeItem {
    pub ingredient: usize,
    pub quantity: i32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig { tick_ms: 250, duration_secs: 120 }
    }
}

impl Default for CustomerConfig {
    fn default() -> Self {
        CustomerConfig {
            max_customers: 10,
            customer_probability: 0.3,
            min_patience: 20.0,
            max_patience: 40.0,
            min_patience_decay: 0.5,
            max_patience_decay: 1.5,
            walk_ticks: 2,
            tick_ms: 1000,
            cascade_probability: 0.25,
            cascade_window_secs: 10.0,
            complaint_probability: 0.3,
            max_order_items: 3,
            min_item_quantity: 1,
            max_item_quantity: 2,
        }
    }
}

impl Default for SellerConfig {
    fn default() -> Self {
        SellerConfig { count: 2, idle_ms: 200 }
    }
}

impl Default for ChefConfig {
    fn default() -> Self {
        ChefConfig {
            count: 2,
            low_water: 5,
            target_level: 30,
            bake_interval_ms: 1500,
            poll_interval_ms: 200,
        }
    }
}

impl Default for SupplyConfig {
    fn default() -> Self {
        SupplyConfig { base_delay_ms: 3000 }
    }
}

fn ingredient(name: &str, initial: i32) -> IngredientConfig {
    IngredientConfig { name: name.to_string(), initial }
}

fn product(name: &str, price: f32, recipe: &[(usize, i32)]) -> ProductConfig {
    ProductConfig {
        name: name.to_string(),
        price,
        initial: 3,
        recipe: recipe
            .iter()
            .map(|&(ingredient, quantity)| RecipeItem { ingredient, quantity })
            .collect(),
    }
}

impl Default for BakeryConfig {
    fn default() -> Self {
        // flour, sugar, eggs, butter, milk, yeast, chocolate, cheese
        BakeryConfig {
            version: CONFIG_VERSION,
            shmem: ShmemConfig::default(),
            simulation: SimulationConfig::default(),
            customers: CustomerConfig::default(),
            sellers: SellerConfig::default(),
            chefs: ChefConfig::default(),
            supply: SupplyConfig::default(),
            ingredients: vec![
                ingredient("flour", 40),
                ingredient("sugar", 30),
                ingredient("eggs", 30),
                ingredient("butter", 25),
                ingredient("milk", 25),
                ingredient("yeast", 20),
                ingredient("chocolate", 15),
                ingredient("cheese", 15),
            ],
            catalog: vec![
                CategoryConfig {
                    name: "bread".to_string(),
                    products: vec![
                        product("baguette", 2.5, &[(0, 2), (5, 1)]),
                        product("sourdough", 4.0, &[(0, 3), (5, 1)]),
                    ],
                },
                CategoryConfig {
                    name: "cake".to_string(),
                    products: vec![
                        product("chocolate cake", 12.0, &[(0, 2), (1, 2), (2, 3), (6, 2)]),
                        product("cheesecake", 10.0, &[(1, 1), (2, 2), (7, 3)]),
                    ],
                },
                CategoryConfig {
                    name: "pastry".to_string(),
                    products: vec![
                        product("croissant", 1.8, &[(0, 1), (3, 2)]),
                        product("pain au chocolat", 2.2, &[(0, 1), (3, 1), (6, 1)]),
                    ],
                },
                CategoryConfig {
                    name: "sandwich".to_string(),
                    products: vec![product("cheese sandwich", 5.5, &[(0, 2), (7, 1), (3, 1)])],
                },
            ],
        }
    }
}

fn check(ok: bool, message: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(BakeryError::Config(message()))
    }
}

impl BakeryConfig {
    /// Versioned text record handed to spawned workers.
    pub fn encode(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<BakeryConfig> {
        let cfg: BakeryConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn guard_names(&self) -> GuardNames {
        GuardNames::with_prefix(&self.shmem.ipc_prefix)
    }

    pub fn product(&self, category: usize, product: usize) -> Option<&ProductConfig> {
        self.catalog.get(category)?.products.get(product)
    }

    pub fn validate(&self) -> Result<()> {
        check(self.version == CONFIG_VERSION, || {
            format!("unsupported config version {}, expected {}", self.version, CONFIG_VERSION)
        })?;
        check(self.ingredients.len() <= MAX_INGREDIENTS, || {
            format!("at most {} ingredients are supported", MAX_INGREDIENTS)
        })?;
        check(!self.catalog.is_empty() && self.catalog.len() <= MAX_CATEGORIES, || {
            format!("catalog needs 1..={} categories", MAX_CATEGORIES)
        })?;
        for category in &self.catalog {
            check(!category.products.is_empty() && category.products.len() <= MAX_PRODUCTS, || {
                format!("category {} needs 1..={} products", category.name, MAX_PRODUCTS)
            })?;
            for p in &category.products {
                for item in &p.recipe {
                    check(item.ingredient < self.ingredients.len() && item.quantity > 0, || {
                        format!("recipe of {} uses an unknown ingredient or a non-positive amount", p.name)
                    })?;
                }
            }
        }

        let c = &self.customers;
        check(c.max_customers > 0, || "max_customers must be positive".to_string())?;
        check(c.min_patience > 0.0 && c.min_patience <= c.max_patience, || {
            "patience bounds must satisfy 0 < min <= max".to_string()
        })?;
        check(c.min_patience_decay > 0.0 && c.min_patience_decay <= c.max_patience_decay, || {
            "patience decay bounds must satisfy 0 < min <= max".to_string()
        })?;
        for (name, p) in [
            ("customer_probability", c.customer_probability),
            ("cascade_probability", c.cascade_probability),
            ("complaint_probability", c.complaint_probability),
        ] {
            check((0.0..=1.0).contains(&p), || format!("{} must lie in [0, 1]", name))?;
        }
        check(c.max_order_items >= 1 && c.max_order_items as usize <= MAX_ORDER_ITEMS, || {
            format!("max_order_items must lie in 1..={}", MAX_ORDER_ITEMS)
        })?;
        check(c.min_item_quantity >= 1 && c.min_item_quantity <= c.max_item_quantity && c.max_item_quantity <= 255, || {
            "item quantity bounds must satisfy 1 <= min <= max <= 255".to_string()
        })?;
        check(c.tick_ms > 0 && self.simulation.tick_ms > 0, || "tick periods must be positive".to_string())?;
        check(self.chefs.low_water < self.chefs.target_level, || {
            "chef low_water must be below target_level".to_string()
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(BakeryConfig::default().validate().is_ok());
    }

    #[test]
    fn encode_decode_round_trip() -> Result<()> {
        let mut cfg = BakeryConfig::default();
        cfg.customers.min_patience = 3.25;
        cfg.customers.cascade_probability = 0.125;
        cfg.shmem.ipc_prefix = "round-trip".to_string();
        let text = cfg.encode()?;
        let back = BakeryConfig::decode(&text)?;
        assert_eq!(back, cfg);
        Ok(())
    }

    #[test]
    fn decode_rejects_other_versions() -> Result<()> {
        let mut cfg = BakeryConfig::default();
        cfg.version = 99;
        let text = cfg.encode()?;
        assert!(matches!(BakeryConfig::decode(&text), Err(BakeryError::Config(_))));
        Ok(())
    }

    #[test]
    fn missing_sections_take_defaults() -> Result<()> {
        let cfg = BakeryConfig::decode("version = 1\n[customers]\nmax_customers = 3\n")?;
        assert_eq!(cfg.customers.max_customers, 3);
        assert_eq!(cfg.customers.tick_ms, 1000);
        assert_eq!(cfg.catalog.len(), 4);
        Ok(())
    }

    #[test]
    fn validate_rejects_oversized_catalog() {
        let mut cfg = BakeryConfig::default();
        let extra = cfg.catalog[0].clone();
        cfg.catalog.push(extra);
        assert!(cfg.validate().is_err());

        let mut cfg = BakeryConfig::default();
        cfg.catalog[1].products[0].recipe[0].ingredient = MAX_INGREDIENTS;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn product_lookup() {
        let cfg = BakeryConfig::default();
        assert_eq!(cfg.product(0, 1).map(|p| p.name.as_str()), Some("sourdough"));
        assert!(cfg.product(0, 5).is_none());
        assert!(cfg.product(9, 0).is_none());
    }
}
