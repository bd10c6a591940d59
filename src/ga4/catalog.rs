//! Embedded GA4 dimension and metric catalog, grouped by category.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

pub struct Category {
    pub name: &'static str,
    /// `(api_name, description)` pairs.
    pub entries: &'static [(&'static str, &'static str)],
}

static DIMENSION_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    DIMENSIONS
        .iter()
        .flat_map(|c| c.entries.iter().map(|(name, _)| *name))
        .collect()
});

/// True when `name` is a dimension the catalog knows about.
pub fn is_known_dimension(name: &str) -> bool {
    DIMENSION_NAMES.contains(name)
}

pub fn category_names(catalog: &[Category]) -> Vec<&'static str> {
    catalog.iter().map(|c| c.name).collect()
}

/// `{category: {count, <noun>: [names]}}` for every category.
pub fn summarize(catalog: &[Category], noun: &str) -> Value {
    let mut out = Map::new();
    for category in catalog {
        let names: Vec<&str> = category.entries.iter().map(|(name, _)| *name).collect();
        out.insert(
            category.name.to_string(),
            json!({ "count": names.len(), noun: names }),
        );
    }
    Value::Object(out)
}

/// `{name: description}` for one category, or `None` if it does not exist.
pub fn describe(catalog: &[Category], category: &str) -> Option<Value> {
    let found = catalog.iter().find(|c| c.name == category)?;
    let entries = found
        .entries
        .iter()
        .map(|(name, description)| (name.to_string(), Value::String(description.to_string())))
        .collect::<Map<_, _>>();
    Some(Value::Object(entries))
}

pub static DIMENSIONS: &[Category] = &[
    Category {
        name: "time",
        entries: &[
            ("date", "The date of the event in YYYYMMDD format."),
            ("dateHour", "The date and hour of the event in YYYYMMDDHH format."),
            ("dateHourMinute", "The date, hour, and minute of the event in YYYYMMDDHHMM format."),
            ("day", "The day of the month (01-31)."),
            ("dayOfWeek", "The day of the week (0-6, where Sunday is 0)."),
            ("hour", "The hour of the day (00-23)."),
            ("minute", "The minute of the hour (00-59)."),
            ("month", "The month of the year (01-12)."),
            ("week", "The week of the year (00-53)."),
            ("year", "The year (e.g., 2024)."),
            ("nthDay", "The number of days since the first visit."),
            ("nthHour", "The number of hours since the first visit."),
            ("nthMinute", "The number of minutes since the first visit."),
            ("nthMonth", "The number of months since the first visit."),
            ("nthWeek", "The number of weeks since the first visit."),
            ("nthYear", "The number of years since the first visit."),
        ],
    },
    Category {
        name: "geography",
        entries: &[
            ("city", "The city of the user."),
            ("cityId", "The ID of the city."),
            ("country", "The country of the user."),
            ("countryId", "The ID of the country."),
            ("region", "The region of the user."),
        ],
    },
    Category {
        name: "technology",
        entries: &[
            ("browser", "The browser used by the user."),
            ("deviceCategory", "The category of the device (e.g., 'desktop', 'mobile', 'tablet')."),
            ("deviceModel", "The model of the device."),
            ("operatingSystem", "The operating system of the user's device."),
            ("operatingSystemVersion", "The version of the operating system."),
            ("platform", "The platform of the user's device (e.g., 'web', 'android', 'ios')."),
            ("platformDeviceCategory", "The platform and device category."),
            ("screenResolution", "The resolution of the user's screen."),
        ],
    },
    Category {
        name: "traffic_source",
        entries: &[
            ("campaignId", "The ID of the campaign."),
            ("campaignName", "The name of the campaign."),
            ("defaultChannelGroup", "The default channel grouping for the traffic source."),
            ("medium", "The medium of the traffic source."),
            ("source", "The source of the traffic."),
            ("sourceMedium", "The source and medium of the traffic."),
            ("sourcePlatform", "The source platform of the traffic."),
            ("sessionCampaignId", "The campaign ID of the session."),
            ("sessionCampaignName", "The campaign name of the session."),
            ("sessionDefaultChannelGroup", "The default channel group of the session."),
            ("sessionMedium", "The medium of the session."),
            ("sessionSource", "The source of the session."),
            ("sessionSourceMedium", "The source and medium of the session."),
            ("sessionSourcePlatform", "The source platform of the session."),
        ],
    },
    Category {
        name: "first_user_attribution",
        entries: &[
            ("firstUserCampaignId", "The campaign ID that first acquired the user."),
            ("firstUserCampaignName", "The campaign name that first acquired the user."),
            ("firstUserDefaultChannelGroup", "The default channel group that first acquired the user."),
            ("firstUserMedium", "The medium that first acquired the user."),
            ("firstUserSource", "The source that first acquired the user."),
            ("firstUserSourceMedium", "The source and medium that first acquired the user."),
            ("firstUserSourcePlatform", "The source platform that first acquired the user."),
        ],
    },
    Category {
        name: "content",
        entries: &[
            ("contentGroup", "The content group on your site/app. Populated by the event parameter 'content_group'."),
            ("contentId", "The ID of the content. Populated by the event parameter 'content_id'."),
            ("contentType", "The type of content. Populated by the event parameter 'content_type'."),
            ("fullPageUrl", "The full URL of the page."),
            ("landingPage", "The page path of the landing page."),
            ("pageLocation", "The full URL of the page."),
            ("pagePath", "The path of the page (e.g., '/home')."),
            ("pagePathPlusQueryString", "The page path and query string."),
            ("pageReferrer", "The referring URL."),
            ("pageTitle", "The title of the page."),
            ("unifiedScreenClass", "The class of the screen."),
            ("unifiedScreenName", "The name of the screen."),
        ],
    },
    Category {
        name: "events",
        entries: &[
            ("eventName", "The name of the event."),
            ("isConversionEvent", "Whether the event is a conversion event ('true' or 'false')."),
            ("method", "The method of the event. Populated by the event parameter 'method'."),
        ],
    },
    Category {
        name: "ecommerce",
        entries: &[
            ("itemBrand", "The brand of the item."),
            ("itemCategory", "The category of the item."),
            ("itemCategory2", "A secondary category for the item."),
            ("itemCategory3", "A third category for the item."),
            ("itemCategory4", "A fourth category for the item."),
            ("itemCategory5", "A fifth category for the item."),
            ("itemId", "The ID of the item."),
            ("itemListId", "The ID of the item list."),
            ("itemListName", "The name of the item list."),
            ("itemName", "The name of the item."),
            ("itemPromotionCreativeName", "The creative name of the item promotion."),
            ("itemPromotionId", "The ID of the item promotion."),
            ("itemPromotionName", "The name of the item promotion."),
            ("orderCoupon", "The coupon code for the order."),
            ("shippingTier", "The shipping tier for the order."),
            ("transactionId", "The ID of the transaction."),
        ],
    },
    Category {
        name: "user_demographics",
        entries: &[
            ("newVsReturning", "Whether the user is new or returning."),
            ("signedInWithUserId", "Whether the user was signed in with a User-ID ('true' or 'false')."),
            ("userAgeBracket", "The age bracket of the user."),
            ("userGender", "The gender of the user."),
            ("language", "The language of the user's browser or device."),
            ("languageCode", "The language code."),
        ],
    },
    Category {
        name: "google_ads",
        entries: &[
            ("googleAdsAdGroupId", "The ID of the Google Ads ad group."),
            ("googleAdsAdGroupName", "The name of the Google Ads ad group."),
            ("googleAdsAdNetworkType", "The ad network type in Google Ads."),
            ("googleAdsCampaignId", "The ID of the Google Ads campaign."),
            ("googleAdsCampaignName", "The name of the Google Ads campaign."),
            ("googleAdsCampaignType", "The type of the Google Ads campaign."),
            ("googleAdsCreativeId", "The ID of the Google Ads creative."),
            ("googleAdsKeyword", "The keyword from Google Ads."),
            ("googleAdsQuery", "The search query from Google Ads."),
            ("firstUserGoogleAdsAdGroupId", "The Google Ads ad group ID that first acquired the user."),
            ("firstUserGoogleAdsAdGroupName", "The Google Ads ad group name that first acquired the user."),
            ("firstUserGoogleAdsCampaignId", "The Google Ads campaign ID that first acquired the user."),
            ("firstUserGoogleAdsCampaignName", "The Google Ads campaign name that first acquired the user."),
            ("firstUserGoogleAdsCampaignType", "The Google Ads campaign type that first acquired the user."),
            ("firstUserGoogleAdsCreativeId", "The Google Ads creative ID that first acquired the user."),
            ("firstUserGoogleAdsKeyword", "The Google Ads keyword that first acquired the user."),
            ("firstUserGoogleAdsNetworkType", "The Google Ads network type that first acquired the user."),
            ("firstUserGoogleAdsQuery", "The Google Ads query that first acquired the user."),
            ("sessionGoogleAdsAdGroupId", "The Google Ads ad group ID of the session."),
            ("sessionGoogleAdsAdGroupName", "The Google Ads ad group name of the session."),
            ("sessionGoogleAdsCampaignId", "The Google Ads campaign ID of the session."),
            ("sessionGoogleAdsCampaignName", "The Google Ads campaign name of the session."),
            ("sessionGoogleAdsCampaignType", "The Google Ads campaign type of the session."),
            ("sessionGoogleAdsCreativeId", "The Google Ads creative ID of the session."),
            ("sessionGoogleAdsKeyword", "The Google Ads keyword of the session."),
            ("sessionGoogleAdsNetworkType", "The Google Ads network type of the session."),
            ("sessionGoogleAdsQuery", "The Google Ads query of the session."),
        ],
    },
    Category {
        name: "manual_campaigns",
        entries: &[
            ("manualAdContent", "The ad content from a manual campaign."),
            ("manualTerm", "The term from a manual campaign."),
            ("firstUserManualAdContent", "The manual ad content that first acquired the user."),
            ("firstUserManualTerm", "The manual term that first acquired the user."),
            ("sessionManualAdContent", "The manual ad content of the session."),
            ("sessionManualTerm", "The manual term of the session."),
        ],
    },
    Category {
        name: "app_specific",
        entries: &[
            ("appVersion", "The version of the app."),
            ("streamId", "The ID of the data stream."),
            ("streamName", "The name of the data stream."),
        ],
    },
    Category {
        name: "cohort_analysis",
        entries: &[
            ("cohort", "The cohort the user belongs to."),
            ("cohortNthDay", "The day number within the cohort."),
            ("cohortNthMonth", "The month number within the cohort."),
            ("cohortNthWeek", "The week number within the cohort."),
        ],
    },
    Category {
        name: "audiences",
        entries: &[
            ("audienceId", "The ID of the audience."),
            ("audienceName", "The name of the audience."),
            ("brandingInterest", "The interest category associated with the user."),
        ],
    },
    Category {
        name: "enhanced_measurement",
        entries: &[
            ("fileExtension", "The extension of the downloaded file."),
            ("fileName", "The name of the downloaded file."),
            ("linkClasses", "The classes of the clicked link."),
            ("linkDomain", "The domain of the clicked link."),
            ("linkId", "The ID of the clicked link."),
            ("linkText", "The text of the clicked link."),
            ("linkUrl", "The URL of the clicked link."),
            ("outbound", "Whether the clicked link was outbound ('true' or 'false')."),
            ("percentScrolled", "The percentage of the page scrolled."),
            ("searchTerm", "The term used for an internal site search."),
            ("videoProvider", "The provider of the video."),
            ("videoTitle", "The title of the video."),
            ("videoUrl", "The URL of the video."),
            ("visible", "Whether the video was visible on the screen."),
        ],
    },
    Category {
        name: "gaming",
        entries: &[
            ("achievementId", "The achievement ID in a game for an event."),
            ("character", "The character in a game."),
            ("groupId", "The group ID in a game."),
            ("virtualCurrencyName", "The name of the virtual currency."),
        ],
    },
    Category {
        name: "advertising",
        entries: &[
            ("adFormat", "The format of the ad that was shown (e.g., 'Interstitial', 'Banner', 'Rewarded')."),
            ("adSourceName", "The name of the ad network or source that served the ad."),
            ("adUnitName", "The name of the ad unit that displayed the ad."),
        ],
    },
    Category {
        name: "testing",
        entries: &[
            ("testDataFilterName", "The name of the test data filter."),
        ],
    },
];

pub static METRICS: &[Category] = &[
    Category {
        name: "user_metrics",
        entries: &[
            ("totalUsers", "The total number of unique users."),
            ("newUsers", "The number of users who interacted with your site or app for the first time."),
            ("activeUsers", "The number of distinct users who have logged an engaged session on your site or app."),
            ("active1DayUsers", "The number of distinct users who have been active on your site or app in the last 1 day."),
            ("active7DayUsers", "The number of distinct users who have been active on your site or app in the last 7 days."),
            ("active28DayUsers", "The number of distinct users who have been active on your site or app in the last 28 days."),
            ("userStickiness", "A measure of how frequently users return to your site or app."),
            ("dauPerMau", "The ratio of daily active users to monthly active users."),
            ("dauPerWau", "The ratio of daily active users to weekly active users."),
            ("wauPerMau", "The ratio of weekly active users to monthly active users."),
        ],
    },
    Category {
        name: "session_metrics",
        entries: &[
            ("sessions", "The total number of sessions."),
            ("sessionsPerUser", "The average number of sessions per user."),
            ("engagedSessions", "The number of sessions that lasted longer than 10 seconds, or had a conversion event, or had at least 2 pageviews or screenviews."),
            ("bounceRate", "The percentage of sessions that were not engaged."),
            ("engagementRate", "The percentage of sessions that were engaged."),
            ("averageSessionDuration", "The average duration of a session in seconds."),
            ("sessionConversionRate", "The percentage of sessions in which a conversion event occurred."),
        ],
    },
    Category {
        name: "pageview_metrics",
        entries: &[
            ("screenPageViews", "The total number of app screens or web pages your users saw."),
            ("screenPageViewsPerSession", "The average number of screens or pages viewed per session."),
            ("screenPageViewsPerUser", "The average number of screens or pages viewed per user."),
        ],
    },
    Category {
        name: "event_metrics",
        entries: &[
            ("eventCount", "The total number of events."),
            ("eventCountPerUser", "The average number of events per user."),
            ("eventsPerSession", "The average number of events per session."),
            ("eventValue", "The total value of all 'value' event parameters."),
            ("conversions", "The total number of conversion events."),
            ("userConversionRate", "The percentage of active users who triggered a conversion event."),
        ],
    },
    Category {
        name: "engagement_metrics",
        entries: &[
            ("userEngagementDuration", "The average time your app was in the foreground or your website was in focus in the browser."),
            ("scrolledUsers", "The number of users who scrolled at least 90% of the page."),
        ],
    },
    Category {
        name: "ecommerce_metrics",
        entries: &[
            ("totalRevenue", "The total revenue from all sources."),
            ("purchaseRevenue", "The total revenue from purchases."),
            ("grossPurchaseRevenue", "The total purchase revenue, before refunds."),
            ("itemRevenue", "The total revenue from items."),
            ("grossItemRevenue", "The total revenue from items, before refunds."),
            ("averageRevenue", "The average revenue per user."),
            ("averagePurchaseRevenue", "The average purchase revenue per user."),
            ("averagePurchaseRevenuePerPayingUser", "The average purchase revenue per paying user."),
            ("transactions", "The total number of transactions."),
            ("ecommercePurchases", "The total number of ecommerce purchases."),
            ("purchasers", "The number of users who made a purchase."),
            ("totalPurchasers", "The total number of unique purchasers."),
            ("purchaserConversionRate", "The percentage of active users who made a purchase."),
            ("firstTimePurchasers", "The number of users who made their first purchase."),
            ("firstTimePurchaserConversionRate", "The percentage of active users who made their first purchase."),
            ("firstTimePurchasersPerNewUser", "The number of first-time purchasers per new user."),
            ("transactionsPerPurchaser", "The average number of transactions per purchaser."),
            ("checkouts", "The number of times users started the checkout process."),
            ("refunds", "The total number of refunds."),
            ("refundAmount", "The total amount of refunds."),
            ("shippingAmount", "The total shipping cost."),
            ("taxAmount", "The total tax amount."),
        ],
    },
    Category {
        name: "item_metrics",
        entries: &[
            ("itemViews", "The number of times users viewed items."),
            ("itemsAddedToCart", "The number of units of items added to the cart."),
            ("itemsCheckedOut", "The number of units of items in the checkout process."),
            ("itemPurchaseQuantity", "The total number of units of items purchased."),
            ("itemViewToPurchaseRate", "The rate at which users who viewed items also purchased them."),
            ("purchaseToViewRate", "The rate at which users who viewed items also purchased them."),
            ("itemListViews", "The number of times users viewed item lists."),
            ("itemListClicks", "The number of times users clicked on items in a list."),
            ("itemListClickThroughRate", "The rate at which users clicked on items in a list."),
            ("itemsClickedInList", "The number of units of items clicked in a list."),
            ("itemsViewedInList", "The number of units of items viewed in a list."),
            ("itemPromotionViews", "The number of times users viewed item promotions."),
            ("itemPromotionClicks", "The number of times users clicked on item promotions."),
            ("itemPromotionClickThroughRate", "The rate at which users clicked on item promotions."),
            ("itemsClickedInPromotion", "The number of units of items clicked in a promotion."),
            ("itemsViewedInPromotion", "The number of units of items viewed in a promotion."),
        ],
    },
    Category {
        name: "advertising_metrics",
        entries: &[
            ("totalAdRevenue", "The total revenue from all ad sources."),
            ("adRevenue", "The total revenue from ads."),
            ("adImpressions", "The total number of ad impressions."),
            ("publisherAdRevenue", "The total revenue from publisher ads."),
            ("publisherAdImpressions", "The total number of publisher ad impressions."),
            ("publisherAdClicks", "The total number of clicks on publisher ads."),
            ("returnOnAdSpend", "The return on investment from your advertising."),
        ],
    },
    Category {
        name: "search_console_metrics",
        entries: &[
            ("organicGoogleSearchClicks", "The number of clicks your website received from organic Google Search."),
            ("organicGoogleSearchImpressions", "The number of times your website appeared in organic Google Search results."),
            ("organicGoogleSearchClickThroughRate", "The click-through rate for your website in organic Google Search results."),
            ("organicGoogleSearchAveragePosition", "The average ranking of your website URLs for the queries reported in Search Console."),
        ],
    },
    Category {
        name: "cohort_metrics",
        entries: &[
            ("cohortActiveUsers", "The number of active users in a cohort."),
            ("cohortTotalUsers", "The total number of users in a cohort."),
        ],
    },
    Category {
        name: "app_crash_metrics",
        entries: &[
            ("crashAffectedUsers", "The number of users who experienced a crash."),
            ("crashFreeUsersRate", "The percentage of users who did not experience a crash."),
        ],
    },
];
