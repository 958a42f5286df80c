//! Shop products: `[商品|name|type|description|price]`.

use serde::{Deserialize, Serialize};

use super::{entity_id, icon_for_type, Domain, KeyedMerge, MergePolicy, Reconcile, Snapshot};
use crate::grammar::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub product_type: String,
    pub description: String,
    pub price: f64,
    pub icon: String,
}

impl Product {
    pub fn from_token(token: &Token) -> Self {
        let name = token.field(0).to_string();
        let product_type = token.field(1).to_string();
        Self {
            id: entity_id("shop", &[&name, &product_type]),
            icon: icon_for_type(&product_type).to_string(),
            description: token.field(2).to_string(),
            price: token.amount(3),
            name,
            product_type,
        }
    }
}

impl Reconcile for Product {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.name.clone(), self.product_type.clone())
    }

    fn absorb(&mut self, incoming: Self, _policy: MergePolicy) {
        // Never additive. A relisting always sets the price; a blank
        // description keeps the earlier text.
        if !incoming.description.is_empty() {
            self.description = incoming.description;
        }
        self.price = incoming.price;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Shop;

impl Domain for Shop {
    type Entity = Product;

    fn name(&self) -> &'static str {
        "shop"
    }

    fn kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::Product]
    }

    fn reconcile(&self, _text: &str, tokens: &[Token]) -> Snapshot<Product> {
        let mut merge = KeyedMerge::new(MergePolicy::LastWriteWins);
        for token in tokens.iter().filter(|t| t.kind == TokenKind::Product) {
            if token.field(0).is_empty() {
                continue;
            }
            merge.insert(Product::from_token(token));
        }
        merge.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReconcilingExtractor;
    use crate::grammar::TokenGrammar;
    use std::sync::Arc;

    #[test]
    fn latest_listing_wins_but_keeps_position() {
        let ex = ReconcilingExtractor::new(Arc::new(TokenGrammar::standard().unwrap()), Shop);
        let text = "[商品|铁剑|武器|普通|100][商品|面包|食品|香|5][商品|铁剑|武器|打折了|80]";
        let products = ex.extract(text);

        assert_eq!(products.len(), 2);
        assert_eq!(products[0].name, "铁剑");
        assert_eq!(products[0].price, 80.0);
        assert_eq!(products[0].description, "打折了");
        assert_eq!(products[1].name, "面包");
    }

    #[test]
    fn blank_relisting_keeps_the_description() {
        let ex = ReconcilingExtractor::new(Arc::new(TokenGrammar::standard().unwrap()), Shop);
        let products = ex.extract("[商品|铁剑|武器|普通|100][商品|铁剑|武器||90]");
        assert_eq!(products[0].description, "普通");
        assert_eq!(products[0].price, 90.0);
    }

    #[test]
    fn bad_price_defaults_to_zero() {
        let ex = ReconcilingExtractor::new(Arc::new(TokenGrammar::standard().unwrap()), Shop);
        let products = ex.extract("[商品|传单|杂物|免费领取|免费]");
        assert_eq!(products[0].price, 0.0);
    }
}
