//! Sensory-dissonance surfaces from pairwise partial roughness.
//!
//! The engine runs in numbered steps, one module each:
//! 1. `timbre`    - canonical partial templates from presets or custom lists
//! 2. `roughness` - Sethares pair kernel and per-point evaluation
//! 3. `grid`      - the (x, y) ratio surface with progressive refinement
//! 4. `minima`    - local minima, plateaus, basins, rational readings
//! 5. `suggest`   - timbre suggestions and candidate scale ratios
//!
//! `common` holds shared ratio/cents math; `pairs` holds the memoized pair
//! index tables the kernel sweeps. Everything is synchronous and CPU-bound;
//! the only shared state is the explicitly passed [`pairs::PairIndexCache`].

pub mod common;
pub mod grid;
pub mod minima;
pub mod pairs;
pub mod roughness;
pub mod suggest;
pub mod timbre;
