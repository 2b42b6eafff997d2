use async_trait::async_trait;
use dropsplit_core::commerce::{
    CartLine, CommerceError, CommercePlatform, CompletedOrder, CompletedOrderLine, DeliveryOption,
    DraftOrderRequest, FulfillmentOrderDetails, FulfillmentOrderLine, MirrorFulfillment, StoreHandle,
};
use dropsplit_shared::models::{Address, TrackingInfo};
use dropsplit_shared::money::{format_minor_units, parse_minor_units};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const ACCESS_TOKEN_HEADER: &str = "X-Platform-Access-Token";
pub const STOREFRONT_TOKEN_HEADER: &str = "X-Platform-Storefront-Access-Token";
const GID_PREFIX: &str = "gid://platform";

// ============================================================================
// Ids
// ============================================================================

/// GraphQL wants global ids; webhooks and the ledger use the bare numeric form.
pub fn to_gid(kind: &str, id: &str) -> String {
    if id.starts_with("gid://") {
        id.to_string()
    } else {
        format!("{}/{}/{}", GID_PREFIX, kind, id)
    }
}

pub fn legacy_id(gid: &str) -> String {
    let path = gid.split('?').next().unwrap_or(gid);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UserError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Node {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyV2 {
    amount: String,
    currency_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyBag {
    shop_money: MoneyV2,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailingAddress {
    first_name: Option<String>,
    last_name: Option<String>,
    company: Option<String>,
    address1: Option<String>,
    address2: Option<String>,
    city: Option<String>,
    province: Option<String>,
    country_code: Option<String>,
    zip: Option<String>,
    phone: Option<String>,
}

impl From<MailingAddress> for Address {
    fn from(a: MailingAddress) -> Self {
        let name = match (a.first_name, a.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (first, last) => first.or(last),
        };
        Address {
            name,
            company: a.company,
            address1: a.address1,
            address2: a.address2,
            city: a.city,
            province: a.province,
            country: a.country_code,
            postal_code: a.zip,
            phone: a.phone,
        }
    }
}

fn mailing_address_input(address: &Address) -> Value {
    let (first, last) = match address.name.as_deref().map(str::trim) {
        Some(name) => match name.split_once(' ') {
            Some((first, last)) => (Some(first), Some(last.trim())),
            None => (None, Some(name)),
        },
        None => (None, None),
    };
    json!({
        "firstName": first,
        "lastName": last,
        "company": address.company,
        "address1": address.address1,
        "address2": address.address2,
        "city": address.city,
        "province": address.province,
        "country": address.country,
        "zip": address.postal_code,
        "phone": address.phone,
    })
}

fn tracking_input(tracking: &TrackingInfo) -> Value {
    json!({
        "company": tracking.company,
        "numbers": tracking.numbers,
        "urls": tracking.urls,
    })
}

// fulfillmentOrder

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FulfillmentOrderData {
    fulfillment_order: Option<FulfillmentOrderNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FulfillmentOrderNode {
    id: String,
    order: OrderRef,
    assigned_location: AssignedLocation,
    #[serde(default)]
    destination: Option<MailingAddress>,
    #[serde(default)]
    delivery_method: Option<DeliveryMethod>,
    line_items: Connection<FulfillmentOrderLineNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRef {
    id: String,
    currency_code: String,
}

#[derive(Debug, Deserialize)]
struct AssignedLocation {
    location: Option<Node>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryMethod {
    #[serde(default)]
    service_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FulfillmentOrderLineNode {
    id: String,
    total_quantity: u32,
    line_item: LineItemNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItemNode {
    id: String,
    variant: Option<Node>,
    original_unit_price_set: MoneyBag,
}

impl FulfillmentOrderNode {
    fn into_details(self) -> Result<FulfillmentOrderDetails, CommerceError> {
        let mut line_items = Vec::with_capacity(self.line_items.nodes.len());
        for line in self.line_items.nodes {
            // Custom items have no variant and cannot belong to a supplier.
            let Some(variant) = line.line_item.variant else {
                continue;
            };
            let unit_price = parse_minor_units(
                &line.line_item.original_unit_price_set.shop_money.amount,
                &line.line_item.original_unit_price_set.shop_money.currency_code,
            )
            .map_err(|e| CommerceError::Decode(e.to_string()))?;
            line_items.push(FulfillmentOrderLine {
                id: legacy_id(&line.id),
                line_item_id: legacy_id(&line.line_item.id),
                variant_id: legacy_id(&variant.id),
                quantity: line.total_quantity,
                unit_price,
            });
        }

        Ok(FulfillmentOrderDetails {
            id: legacy_id(&self.id),
            order_id: legacy_id(&self.order.id),
            assigned_location_id: self
                .assigned_location
                .location
                .map(|l| legacy_id(&l.id))
                .unwrap_or_default(),
            currency: self.order.currency_code,
            destination: self.destination.map(Address::from).unwrap_or_default(),
            shipping_service_code: self.delivery_method.and_then(|m| m.service_code),
            line_items,
        })
    }
}

// cartCreate

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartCreateData {
    cart_create: CartCreatePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartCreatePayload {
    cart: Option<Cart>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cart {
    delivery_groups: Connection<DeliveryGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryGroup {
    delivery_options: Vec<CartDeliveryOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartDeliveryOption {
    handle: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    code: Option<String>,
    estimated_cost: MoneyV2,
}

/// A cart split across locations has one delivery group per location. An
/// option is offered for the cart only when every group offers it, and costs
/// the sum over groups.
fn merge_delivery_groups(groups: Vec<DeliveryGroup>) -> Result<Vec<DeliveryOption>, CommerceError> {
    let group_count = groups.len();
    let mut merged: BTreeMap<String, (DeliveryOption, usize)> = BTreeMap::new();

    for group in groups {
        for option in group.delivery_options {
            let amount = parse_minor_units(&option.estimated_cost.amount, &option.estimated_cost.currency_code)
                .map_err(|e| CommerceError::Decode(e.to_string()))?;
            let code = option.code.clone().unwrap_or_else(|| option.handle.clone());
            let entry = merged.entry(code.clone()).or_insert_with(|| {
                (
                    DeliveryOption {
                        title: option.title.clone().unwrap_or_else(|| code.clone()),
                        code,
                        amount: 0,
                        currency: option.estimated_cost.currency_code.clone(),
                    },
                    0,
                )
            });
            entry.0.amount += amount;
            entry.1 += 1;
        }
    }

    Ok(merged
        .into_values()
        .filter(|(_, seen)| *seen == group_count)
        .map(|(option, _)| option)
        .collect())
}

// draftOrderCreate / draftOrderComplete

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftOrderCreateData {
    draft_order_create: DraftOrderPayload<Node>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftOrderCompleteData {
    draft_order_complete: DraftOrderPayload<CompletedDraft>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftOrderPayload<T> {
    draft_order: Option<T>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
struct CompletedDraft {
    order: Option<CompletedOrderNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletedOrderNode {
    id: String,
    line_items: Connection<CompletedLineNode>,
}

#[derive(Debug, Deserialize)]
struct CompletedLineNode {
    id: String,
    quantity: u32,
    variant: Option<Node>,
}

// Mutations returning only user errors plus an optional object.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationPayload {
    #[serde(default)]
    fulfillment: Option<Node>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

fn check_user_errors(errors: Vec<UserError>) -> Result<(), CommerceError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CommerceError::UserErrors(errors.into_iter().map(|e| e.message).collect()))
    }
}

/// The single payload field a mutation returns, keyed by the mutation name.
fn take_payload(mut data: BTreeMap<String, MutationPayload>, field: &str) -> Result<MutationPayload, CommerceError> {
    data.remove(field)
        .ok_or_else(|| CommerceError::Decode(format!("response has no {}", field)))
}

// ============================================================================
// Queries
// ============================================================================

const FULFILLMENT_ORDER_QUERY: &str = r#"
query FulfillmentOrder($id: ID!) {
  fulfillmentOrder(id: $id) {
    id
    order { id currencyCode }
    assignedLocation { location { id } }
    destination { firstName lastName company address1 address2 city province countryCode zip phone }
    deliveryMethod { serviceCode }
    lineItems(first: 250) {
      nodes {
        id
        totalQuantity
        lineItem { id variant { id } originalUnitPriceSet { shopMoney { amount currencyCode } } }
      }
    }
  }
}"#;

const CART_CREATE_MUTATION: &str = r#"
mutation CartEstimate($input: CartInput!) {
  cartCreate(input: $input) {
    cart {
      deliveryGroups(first: 25) {
        nodes { deliveryOptions { handle title code estimatedCost { amount currencyCode } } }
      }
    }
    userErrors { field message }
  }
}"#;

const DRAFT_ORDER_CREATE_MUTATION: &str = r#"
mutation DraftOrderCreate($input: DraftOrderInput!) {
  draftOrderCreate(input: $input) {
    draftOrder { id }
    userErrors { field message }
  }
}"#;

const DRAFT_ORDER_COMPLETE_MUTATION: &str = r#"
mutation DraftOrderComplete($id: ID!) {
  draftOrderComplete(id: $id, paymentPending: true) {
    draftOrder { order { id lineItems(first: 250) { nodes { id quantity variant { id } } } } }
    userErrors { field message }
  }
}"#;

const ORDER_CANCEL_MUTATION: &str = r#"
mutation OrderCancel($orderId: ID!) {
  orderCancel(orderId: $orderId, reason: OTHER, refund: false, restock: true, notifyCustomer: false) {
    userErrors { field message }
  }
}"#;

const FULFILLMENT_CREATE_MUTATION: &str = r#"
mutation FulfillmentCreate($fulfillment: FulfillmentInput!) {
  fulfillmentCreate(fulfillment: $fulfillment) {
    fulfillment { id }
    userErrors { field message }
  }
}"#;

const TRACKING_UPDATE_MUTATION: &str = r#"
mutation TrackingUpdate($fulfillmentId: ID!, $trackingInfoInput: FulfillmentTrackingInput!) {
  fulfillmentTrackingInfoUpdate(fulfillmentId: $fulfillmentId, trackingInfoInput: $trackingInfoInput, notifyCustomer: true) {
    fulfillment { id }
    userErrors { field message }
  }
}"#;

const FULFILLMENT_CANCEL_MUTATION: &str = r#"
mutation FulfillmentCancel($id: ID!) {
  fulfillmentCancel(id: $id) {
    fulfillment { id }
    userErrors { field message }
  }
}"#;

const FULFILLMENT_ORDER_OPEN_MUTATION: &str = r#"
mutation FulfillmentOrderOpen($id: ID!) {
  fulfillmentOrderOpen(id: $id) {
    userErrors { field message }
  }
}"#;

// ============================================================================
// Client
// ============================================================================

/// GraphQL client for the commerce platform's admin and storefront APIs.
/// Every call authenticates as the store it targets.
pub struct PlatformClient {
    client: reqwest::Client,
    api_version: String,
}

impl PlatformClient {
    pub fn new(api_version: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("dropsplit/0.1")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_version: api_version.to_string(),
        })
    }

    fn admin_url(&self, shop: &str) -> String {
        format!("https://{}/admin/api/{}/graphql.json", shop, self.api_version)
    }

    fn storefront_url(&self, shop: &str) -> String {
        format!("https://{}/api/{}/graphql.json", shop, self.api_version)
    }

    async fn admin<T: DeserializeOwned>(&self, store: &StoreHandle, query: &str, variables: Value) -> Result<T, CommerceError> {
        let request = self
            .client
            .post(self.admin_url(&store.shop_domain))
            .header(ACCESS_TOKEN_HEADER, store.access_token.expose().as_str());
        self.execute(request, query, variables, &store.shop_domain).await
    }

    async fn storefront<T: DeserializeOwned>(&self, store: &StoreHandle, query: &str, variables: Value) -> Result<T, CommerceError> {
        let request = self
            .client
            .post(self.storefront_url(&store.shop_domain))
            .header(STOREFRONT_TOKEN_HEADER, store.access_token.expose().as_str());
        self.execute(request, query, variables, &store.shop_domain).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        query: &str,
        variables: Value,
        shop: &str,
    ) -> Result<T, CommerceError> {
        let response = request
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| CommerceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_error_status(status, body, shop));
        }

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| CommerceError::Decode(e.to_string()))?;
        graphql_result(body)
    }
}

fn handle_error_status(status: reqwest::StatusCode, body: String, shop: &str) -> CommerceError {
    match status {
        reqwest::StatusCode::NOT_FOUND => CommerceError::NotFound(shop.to_string()),
        reqwest::StatusCode::TOO_MANY_REQUESTS => CommerceError::RateLimited,
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => CommerceError::Api {
            status: status.as_u16(),
            message: format!("access denied for {}", shop),
        },
        _ => CommerceError::Api {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        },
    }
}

fn graphql_result<T>(body: GraphQlResponse<T>) -> Result<T, CommerceError> {
    if !body.errors.is_empty() {
        let throttled = body.errors.iter().any(|e| {
            e.extensions
                .as_ref()
                .and_then(|x| x.get("code"))
                .and_then(Value::as_str)
                == Some("THROTTLED")
        });
        if throttled {
            return Err(CommerceError::RateLimited);
        }
        return Err(CommerceError::Api {
            status: 200,
            message: body.errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; "),
        });
    }

    body.data.ok_or_else(|| CommerceError::Decode("response has no data".to_string()))
}

#[async_trait]
impl CommercePlatform for PlatformClient {
    async fn fulfillment_order(
        &self,
        store: &StoreHandle,
        fulfillment_order_id: &str,
    ) -> Result<FulfillmentOrderDetails, CommerceError> {
        let data: FulfillmentOrderData = self
            .admin(
                store,
                FULFILLMENT_ORDER_QUERY,
                json!({ "id": to_gid("FulfillmentOrder", fulfillment_order_id) }),
            )
            .await?;

        data.fulfillment_order
            .ok_or_else(|| CommerceError::NotFound(format!("fulfillment order {}", fulfillment_order_id)))?
            .into_details()
    }

    async fn delivery_options(
        &self,
        store: &StoreHandle,
        lines: &[CartLine],
        destination: &Address,
        currency: &str,
    ) -> Result<Vec<DeliveryOption>, CommerceError> {
        let input = json!({
            "lines": lines.iter().map(|l| json!({
                "merchandiseId": to_gid("ProductVariant", &l.variant_id),
                "quantity": l.quantity,
            })).collect::<Vec<_>>(),
            "buyerIdentity": {
                "countryCode": destination.country,
                "deliveryAddressPreferences": [{
                    "deliveryAddress": {
                        "address1": destination.address1,
                        "address2": destination.address2,
                        "city": destination.city,
                        "province": destination.province,
                        "country": destination.country,
                        "zip": destination.postal_code,
                    }
                }],
            },
            "attributes": [{ "key": "presentment_currency", "value": currency }],
        });

        let data: CartCreateData = self
            .storefront(store, CART_CREATE_MUTATION, json!({ "input": input }))
            .await?;
        check_user_errors(data.cart_create.user_errors)?;

        let cart = data
            .cart_create
            .cart
            .ok_or_else(|| CommerceError::Decode("cartCreate returned no cart".to_string()))?;
        merge_delivery_groups(cart.delivery_groups.nodes)
    }

    async fn create_draft_order(
        &self,
        store: &StoreHandle,
        draft: &DraftOrderRequest,
    ) -> Result<String, CommerceError> {
        let input = json!({
            "presentmentCurrencyCode": draft.currency,
            "shippingAddress": mailing_address_input(&draft.shipping_address),
            "shippingLine": {
                "title": draft.shipping_title,
                "shippingRateHandle": draft.shipping_code,
                "priceWithCurrency": {
                    "amount": format_minor_units(draft.shipping_price, &draft.currency),
                    "currencyCode": draft.currency,
                },
            },
            "lineItems": draft.lines.iter().map(|l| json!({
                "variantId": to_gid("ProductVariant", &l.variant_id),
                "quantity": l.quantity,
                "priceOverride": {
                    "amount": format_minor_units(l.unit_price, &draft.currency),
                    "currencyCode": draft.currency,
                },
            })).collect::<Vec<_>>(),
            "tags": draft.tags,
            "note": draft.note,
        });

        let data: DraftOrderCreateData = self
            .admin(store, DRAFT_ORDER_CREATE_MUTATION, json!({ "input": input }))
            .await?;
        check_user_errors(data.draft_order_create.user_errors)?;

        data.draft_order_create
            .draft_order
            .map(|d| legacy_id(&d.id))
            .ok_or_else(|| CommerceError::Decode("draftOrderCreate returned no draft".to_string()))
    }

    async fn complete_draft_order(
        &self,
        store: &StoreHandle,
        draft_order_id: &str,
    ) -> Result<CompletedOrder, CommerceError> {
        let data: DraftOrderCompleteData = self
            .admin(
                store,
                DRAFT_ORDER_COMPLETE_MUTATION,
                json!({ "id": to_gid("DraftOrder", draft_order_id) }),
            )
            .await?;
        check_user_errors(data.draft_order_complete.user_errors)?;

        let order = data
            .draft_order_complete
            .draft_order
            .and_then(|d| d.order)
            .ok_or_else(|| CommerceError::Decode("draftOrderComplete returned no order".to_string()))?;

        Ok(CompletedOrder {
            order_id: legacy_id(&order.id),
            line_items: order
                .line_items
                .nodes
                .into_iter()
                .filter_map(|line| {
                    let variant = line.variant?;
                    Some(CompletedOrderLine {
                        id: legacy_id(&line.id),
                        variant_id: legacy_id(&variant.id),
                        quantity: line.quantity,
                    })
                })
                .collect(),
        })
    }

    async fn cancel_order(&self, store: &StoreHandle, order_id: &str) -> Result<(), CommerceError> {
        let data: BTreeMap<String, MutationPayload> = self
            .admin(store, ORDER_CANCEL_MUTATION, json!({ "orderId": to_gid("Order", order_id) }))
            .await?;
        check_user_errors(take_payload(data, "orderCancel")?.user_errors)
    }

    async fn create_fulfillment(
        &self,
        store: &StoreHandle,
        fulfillment: &MirrorFulfillment,
    ) -> Result<String, CommerceError> {
        let input = json!({
            "lineItemsByFulfillmentOrder": [{
                "fulfillmentOrderId": to_gid("FulfillmentOrder", &fulfillment.fulfillment_order_id),
                "fulfillmentOrderLineItems": fulfillment.lines.iter().map(|l| json!({
                    "id": to_gid("FulfillmentOrderLineItem", &l.fulfillment_order_line_id),
                    "quantity": l.quantity,
                })).collect::<Vec<_>>(),
            }],
            "trackingInfo": tracking_input(&fulfillment.tracking),
            "notifyCustomer": fulfillment.notify_customer,
        });

        let data: BTreeMap<String, MutationPayload> = self
            .admin(store, FULFILLMENT_CREATE_MUTATION, json!({ "fulfillment": input }))
            .await?;
        let payload = take_payload(data, "fulfillmentCreate")?;
        check_user_errors(payload.user_errors)?;

        payload
            .fulfillment
            .map(|f| legacy_id(&f.id))
            .ok_or_else(|| CommerceError::Decode("fulfillmentCreate returned no fulfillment".to_string()))
    }

    async fn update_tracking(
        &self,
        store: &StoreHandle,
        fulfillment_id: &str,
        tracking: &TrackingInfo,
    ) -> Result<(), CommerceError> {
        let data: BTreeMap<String, MutationPayload> = self
            .admin(
                store,
                TRACKING_UPDATE_MUTATION,
                json!({
                    "fulfillmentId": to_gid("Fulfillment", fulfillment_id),
                    "trackingInfoInput": tracking_input(tracking),
                }),
            )
            .await?;
        check_user_errors(take_payload(data, "fulfillmentTrackingInfoUpdate")?.user_errors)
    }

    async fn cancel_fulfillment(&self, store: &StoreHandle, fulfillment_id: &str) -> Result<(), CommerceError> {
        let data: BTreeMap<String, MutationPayload> = self
            .admin(store, FULFILLMENT_CANCEL_MUTATION, json!({ "id": to_gid("Fulfillment", fulfillment_id) }))
            .await?;
        check_user_errors(take_payload(data, "fulfillmentCancel")?.user_errors)
    }

    async fn reopen_fulfillment_order(
        &self,
        store: &StoreHandle,
        fulfillment_order_id: &str,
    ) -> Result<(), CommerceError> {
        let data: BTreeMap<String, MutationPayload> = self
            .admin(
                store,
                FULFILLMENT_ORDER_OPEN_MUTATION,
                json!({ "id": to_gid("FulfillmentOrder", fulfillment_order_id) }),
            )
            .await?;
        check_user_errors(take_payload(data, "fulfillmentOrderOpen")?.user_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_conversion() {
        assert_eq!(to_gid("Order", "42"), "gid://platform/Order/42");
        assert_eq!(to_gid("Order", "gid://platform/Order/42"), "gid://platform/Order/42");
        assert_eq!(legacy_id("gid://platform/LineItem/7?source=draft"), "7");
        assert_eq!(legacy_id("7"), "7");
    }

    #[test]
    fn test_fulfillment_order_decodes_to_details() {
        let body = json!({
            "data": {
                "fulfillmentOrder": {
                    "id": "gid://platform/FulfillmentOrder/11",
                    "order": { "id": "gid://platform/Order/22", "currencyCode": "USD" },
                    "assignedLocation": { "location": { "id": "gid://platform/Location/33" } },
                    "destination": { "firstName": "Ada", "lastName": "Lovelace", "city": "London", "countryCode": "GB" },
                    "deliveryMethod": { "serviceCode": "express" },
                    "lineItems": { "nodes": [
                        {
                            "id": "gid://platform/FulfillmentOrderLineItem/44",
                            "totalQuantity": 2,
                            "lineItem": {
                                "id": "gid://platform/LineItem/55",
                                "variant": { "id": "gid://platform/ProductVariant/66" },
                                "originalUnitPriceSet": { "shopMoney": { "amount": "25.00", "currencyCode": "USD" } }
                            }
                        },
                        {
                            "id": "gid://platform/FulfillmentOrderLineItem/45",
                            "totalQuantity": 1,
                            "lineItem": {
                                "id": "gid://platform/LineItem/56",
                                "variant": null,
                                "originalUnitPriceSet": { "shopMoney": { "amount": "5.00", "currencyCode": "USD" } }
                            }
                        }
                    ]}
                }
            }
        });

        let response: GraphQlResponse<FulfillmentOrderData> = serde_json::from_value(body).unwrap();
        let details = graphql_result(response)
            .unwrap()
            .fulfillment_order
            .unwrap()
            .into_details()
            .unwrap();

        assert_eq!(details.id, "11");
        assert_eq!(details.order_id, "22");
        assert_eq!(details.assigned_location_id, "33");
        assert_eq!(details.shipping_service_code.as_deref(), Some("express"));
        assert_eq!(details.destination.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(details.line_items.len(), 1);
        assert_eq!(details.line_items[0].variant_id, "66");
        assert_eq!(details.line_items[0].unit_price, 2500);
        assert_eq!(details.line_items[0].quantity, 2);
    }

    #[test]
    fn test_delivery_groups_merge_to_common_options() {
        let groups: Vec<DeliveryGroup> = serde_json::from_value(json!([
            { "deliveryOptions": [
                { "handle": "h1", "title": "Standard", "code": "standard", "estimatedCost": { "amount": "5.00", "currencyCode": "USD" } },
                { "handle": "h2", "title": "Express", "code": "express", "estimatedCost": { "amount": "15.00", "currencyCode": "USD" } }
            ]},
            { "deliveryOptions": [
                { "handle": "h3", "title": "Standard", "code": "standard", "estimatedCost": { "amount": "3.50", "currencyCode": "USD" } }
            ]}
        ]))
        .unwrap();

        let options = merge_delivery_groups(groups).unwrap();

        assert_eq!(options.len(), 1);
        assert_eq!(options[0].code, "standard");
        assert_eq!(options[0].amount, 850);
    }

    #[test]
    fn test_throttled_errors_map_to_rate_limit() {
        let response: GraphQlResponse<Value> = serde_json::from_value(json!({
            "errors": [{ "message": "Throttled", "extensions": { "code": "THROTTLED" } }]
        }))
        .unwrap();

        assert!(matches!(graphql_result(response), Err(CommerceError::RateLimited)));
    }

    #[test]
    fn test_mutation_user_errors_surface() {
        let data: BTreeMap<String, MutationPayload> = serde_json::from_value(json!({
            "fulfillmentCancel": { "fulfillment": null, "userErrors": [{ "field": ["id"], "message": "Fulfillment is already cancelled" }] }
        }))
        .unwrap();

        let payload = take_payload(data, "fulfillmentCancel").unwrap();
        match check_user_errors(payload.user_errors) {
            Err(CommerceError::UserErrors(messages)) => assert_eq!(messages, vec!["Fulfillment is already cancelled"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_address_name_is_split_for_input() {
        let address = Address {
            name: Some("Ada King Lovelace".into()),
            city: Some("London".into()),
            ..Default::default()
        };
        let input = mailing_address_input(&address);
        assert_eq!(input["firstName"], "Ada");
        assert_eq!(input["lastName"], "King Lovelace");
    }
}
